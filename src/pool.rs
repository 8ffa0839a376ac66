//! Per-sink scanout buffer rings.
//!
//! Every active secondary output owns exactly two scanout-capable buffers
//! plus their kernel framebuffer ids. The buffer at the current index is
//! presumed on-screen (or pending flip) and is never written; the other one
//! is the sole blit target. A pool entry is either fully valid or absent;
//! partial states only exist inside creation and teardown.

use std::collections::HashMap;
use std::os::fd::OwnedFd;

use anyhow::Context;
use drm::buffer::{Buffer as _, DrmFourcc};
use drm::control::dumbbuffer::DumbBuffer;
use drm::control::framebuffer;
use tracing::{info, warn};

use crate::kms::display::Display;
use crate::kms::KmsDevice;

/// Which of the two ring slots is front. Kept separate from the buffers so
/// the flip arithmetic is trivially testable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingIndex {
    current: usize,
}

impl RingIndex {
    pub fn current(self) -> usize {
        self.current
    }

    /// The back slot, the only valid write target.
    pub fn back(self) -> usize {
        1 - self.current
    }

    /// Rotates after a successful page-flip submission.
    pub fn advance(&mut self) {
        self.current = 1 - self.current;
    }
}

/// One scanout buffer and the kernel objects that make it presentable.
pub struct SinkBuffer {
    pub buffer: DumbBuffer,
    pub fb: framebuffer::Handle,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub format: DrmFourcc,
    /// Export for the 2-D accelerator; closed on teardown.
    pub dma_fd: OwnedFd,
}

pub struct SinkRing {
    slots: [SinkBuffer; 2],
    index: RingIndex,
}

impl SinkRing {
    pub fn back(&self) -> &SinkBuffer {
        &self.slots[self.index.back()]
    }

    pub fn back_mut(&mut self) -> &mut SinkBuffer {
        &mut self.slots[self.index.back()]
    }

    pub fn advance(&mut self) {
        self.index.advance();
    }
}

/// Owns a ring per connector id.
#[derive(Default)]
pub struct SinkBufferPool {
    rings: HashMap<u32, SinkRing>,
}

impl SinkBufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, connector_id: u32) -> bool {
        self.rings.contains_key(&connector_id)
    }

    pub fn is_empty(&self) -> bool {
        self.rings.is_empty()
    }

    pub fn ring(&self, connector_id: u32) -> Option<&SinkRing> {
        self.rings.get(&connector_id)
    }

    pub fn ring_mut(&mut self, connector_id: u32) -> Option<&mut SinkRing> {
        self.rings.get_mut(&connector_id)
    }

    /// Allocates the two-slot ring for a sink at its native resolution in
    /// 32-bit XRGB. Replaces any previous entry for the connector.
    pub fn create(&mut self, kms: &KmsDevice, display: &Display) -> anyhow::Result<()> {
        self.destroy(kms, display.connector_id);

        let width = display.width();
        let height = display.height();

        let mut slots = Vec::with_capacity(2);
        for _ in 0..2 {
            match Self::create_slot(kms, width, height) {
                Ok(slot) => slots.push(slot),
                Err(err) => {
                    for slot in slots {
                        Self::destroy_slot(kms, slot);
                    }
                    return Err(err.context(format!("error creating buffers for {}", display.name)));
                }
            }
        }

        let slots: [SinkBuffer; 2] = slots.try_into().map_err(|_| ()).expect("two slots");
        self.rings.insert(
            display.connector_id,
            SinkRing {
                slots,
                index: RingIndex::default(),
            },
        );

        info!("created buffers for display {}", display.name);
        Ok(())
    }

    fn create_slot(kms: &KmsDevice, width: u32, height: u32) -> anyhow::Result<SinkBuffer> {
        let buffer = kms.create_scanout_buffer(width, height)?;

        let (bo_width, bo_height) = buffer.size();
        let pitch = buffer.pitch();
        let format = buffer.format();

        let fb = match kms.create_framebuffer(&buffer) {
            Ok(fb) => fb,
            Err(err) => {
                kms.destroy_scanout_buffer(buffer);
                return Err(err);
            }
        };

        let dma_fd = match kms.export_dma_fd(&buffer) {
            Ok(fd) => fd,
            Err(err) => {
                kms.destroy_framebuffer(fb);
                kms.destroy_scanout_buffer(buffer);
                return Err(err).context("error exporting DMA fd");
            }
        };

        Ok(SinkBuffer {
            buffer,
            fb,
            width: bo_width,
            height: bo_height,
            pitch,
            format,
            dma_fd,
        })
    }

    fn destroy_slot(kms: &KmsDevice, slot: SinkBuffer) {
        // Unregister the framebuffer before destroying its buffer object so
        // the kernel never holds a dangling reference. The DMA fd closes
        // when the slot drops.
        kms.destroy_framebuffer(slot.fb);
        kms.destroy_scanout_buffer(slot.buffer);
    }

    /// Frees the ring for a sink, if present.
    pub fn destroy(&mut self, kms: &KmsDevice, connector_id: u32) {
        if let Some(ring) = self.rings.remove(&connector_id) {
            for slot in ring.slots {
                Self::destroy_slot(kms, slot);
            }
            info!("destroyed buffers for connector {connector_id}");
        }
    }

    pub fn destroy_all(&mut self, kms: &KmsDevice) {
        let ids: Vec<u32> = self.rings.keys().copied().collect();
        for id in ids {
            self.destroy(kms, id);
        }
    }

    /// Returns the ring for a sink, lazily re-creating it if missing.
    /// `None` signals unrecoverable allocation failure for this frame.
    pub fn ensure(&mut self, kms: &KmsDevice, display: &Display) -> Option<&mut SinkRing> {
        if !self.rings.contains_key(&display.connector_id) {
            warn!("no buffers for {}, attempting to recreate", display.name);
            if let Err(err) = self.create(kms, display) {
                warn!("buffer recreation for {} failed: {err:#}", display.name);
                return None;
            }
        }
        self.rings.get_mut(&display.connector_id)
    }
}
