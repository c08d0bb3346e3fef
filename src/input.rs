// src/input.rs
//
// Synthetic key dispatch and the combo throttle. Key events are
// fire-and-forget press-and-release pairs; the throttle caps how many fire
// back-to-back so the agent keys at a human combo cadence.

use crate::types::Direction;
use anyhow::{anyhow, Result};
use enigo::{Direction as KeyAction, Enigo, Key, Keyboard, Settings};
use tracing::debug;

/// Press-and-release of one directional key. Trait boundary so the engine
/// is testable without injecting real input.
pub trait KeyTap {
    fn tap(&mut self, direction: Direction) -> Result<()>;
}

pub struct EnigoKeys {
    enigo: Enigo,
}

impl EnigoKeys {
    pub fn new() -> Result<Self> {
        let enigo = Enigo::new(&Settings::default())
            .map_err(|e| anyhow!("input backend unavailable: {e}"))?;
        Ok(Self { enigo })
    }
}

impl KeyTap for EnigoKeys {
    fn tap(&mut self, direction: Direction) -> Result<()> {
        let key = match direction {
            Direction::Left => Key::LeftArrow,
            Direction::Down => Key::DownArrow,
            Direction::Up => Key::UpArrow,
            Direction::Right => Key::RightArrow,
        };
        self.enigo
            .key(key, KeyAction::Click)
            .map_err(|e| anyhow!("key dispatch failed: {e}"))?;
        debug!(lane = direction.label(), "key dispatched");
        Ok(())
    }
}

/// Caps consecutive dispatches: every allowed event counts toward the
/// limit; the event that would exceed it is suppressed and the counter
/// starts over.
pub struct ComboThrottle {
    limit: u32,
    count: u32,
}

impl ComboThrottle {
    pub fn new(limit: u32) -> Self {
        Self { limit, count: 0 }
    }

    /// True when the event may be dispatched.
    pub fn allow(&mut self) -> bool {
        if self.count >= self.limit {
            self.count = 0;
            return false;
        }
        self.count += 1;
        true
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}
