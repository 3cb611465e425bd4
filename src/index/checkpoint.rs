//! Periodic checkpoints: partial saves that bound rebuild cost.
//!
//! With a frequency of `N`, every `N`th new chapter triggers a checkpoint:
//! a snapshot of the volume index and index page map into the layout's
//! next save slot, written cooperatively — each zone contributes its own
//! volume-index shard from the chapter-close path, and the last zone to
//! contribute commits the slot. Open chapters are never checkpointed, so a
//! checkpoint is only a rebuild baseline, never a loadable save.
//!
//! A checkpoint may be left incomplete by a crash or an IO error; the
//! uncommitted slot simply stays invalid and the previous save or
//! checkpoint remains the latest.

use std::sync::Mutex;

use tracing::{info, warn};

use crate::error::Result;
use crate::layout::{volume_index_component, SaveKind, COMPONENT_PAGE_MAP};

use super::IndexCore;

struct CheckpointState {
    frequency: u32,
    in_progress: bool,
    zones_done: Vec<bool>,
    /// Checkpoints completed this session.
    count: u64,
}

pub struct Checkpoint {
    state: Mutex<CheckpointState>,
}

impl Checkpoint {
    pub fn new(zone_count: u32, frequency: u32) -> Self {
        Checkpoint {
            state: Mutex::new(CheckpointState {
                frequency,
                in_progress: false,
                zones_done: vec![false; zone_count as usize],
                count: 0,
            }),
        }
    }

    pub fn frequency(&self) -> u32 {
        self.state.lock().unwrap().frequency
    }

    /// Change the frequency, returning the previous value.
    pub fn set_frequency(&self, frequency: u32) -> u32 {
        let mut state = self.state.lock().unwrap();
        std::mem::replace(&mut state.frequency, frequency)
    }

    pub fn count(&self) -> u64 {
        self.state.lock().unwrap().count
    }

    /// Abandon any checkpoint in progress (the layout's pending save is
    /// cancelled separately).
    pub fn abort(&self) {
        self.state.lock().unwrap().in_progress = false;
    }
}

/// Advance the checkpoint state machine from the zone that just opened
/// `new_virtual_chapter`. Called on every chapter close.
pub fn process_checkpointing(
    core: &IndexCore,
    zone: u32,
    new_virtual_chapter: u64,
    oldest_chapter: u64,
) -> Result<()> {
    let mut state = core.checkpoint.state.lock().unwrap();
    if state.frequency == 0 {
        return Ok(());
    }

    if !state.in_progress {
        if new_virtual_chapter % state.frequency as u64 != 0 {
            return Ok(());
        }
        // Start a checkpoint in the next rotating slot.
        let mut layout = core.layout.lock().unwrap();
        if let Err(e) = layout.begin_save(
            SaveKind::Checkpoint,
            oldest_chapter,
            new_virtual_chapter,
            core.zone_count(),
        ) {
            warn!(error = %e, "could not start checkpoint");
            return Ok(());
        }
        drop(layout);
        state.in_progress = true;
        state.zones_done.iter_mut().for_each(|done| *done = false);
        info!(chapter = new_virtual_chapter, "starting checkpoint");
    }

    if !state.zones_done[zone as usize] {
        let mut layout = core.layout.lock().unwrap();
        let result = layout.save_component(volume_index_component(zone), |writer| {
            let mut writer = writer;
            core.volume_index.write_zone_to(zone, &mut writer)
        });
        if let Err(e) = result {
            warn!(zone, error = %e, "checkpoint zone save failed, aborting checkpoint");
            layout.cancel_save();
            state.in_progress = false;
            return Ok(());
        }
        state.zones_done[zone as usize] = true;
    }

    if state.zones_done.iter().all(|&done| done) {
        let mut layout = core.layout.lock().unwrap();
        let result = layout
            .save_component(COMPONENT_PAGE_MAP, |writer| {
                let mut writer = writer;
                core.volume.index_page_map.read().unwrap().write_to(&mut writer)
            })
            .and_then(|()| layout.commit_save());
        match result {
            Ok(()) => {
                state.count += 1;
                info!(checkpoints = state.count, "finished checkpoint");
            }
            Err(e) => {
                warn!(error = %e, "checkpoint commit failed");
                layout.cancel_save();
            }
        }
        state.in_progress = false;
    }
    Ok(())
}
