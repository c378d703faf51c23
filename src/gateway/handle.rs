//! Collaborator-facing handle.
//!
//! The admin page, display and persistence layers live outside the core.
//! They read state and statistics and push configuration through a
//! [`GatewayHandle`]; the main loop picks configuration changes up and
//! applies them once the radio is quiesced.

use super::irq::IrqSlot;
use super::state::{RadioState, StateCell};
use super::stats::{Statistics, StatsSnapshot};
use crate::lora::{ChannelConfig, ChannelError, FrequencyPlan};
use log::{info, warn, LevelFilter};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Highest debug level (most verbose).
pub const MAX_DEBUG_LEVEL: u8 = 4;

/// Log filter for a gateway debug level (0 = errors only, 4 = everything).
pub fn level_filter(level: u8) -> LevelFilter {
    match level {
        0 => LevelFilter::Error,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

struct Shared {
    plan: FrequencyPlan,
    config: Mutex<ChannelConfig>,
    pending_config: Mutex<Option<ChannelConfig>>,
    stats: Statistics,
    state: StateCell,
    irq: Arc<IrqSlot>,
    debug_level: AtomicU8,
    restart_requested: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("Gateway handle mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// Cheap to clone; all clones observe the same gateway.
#[derive(Clone)]
pub struct GatewayHandle {
    shared: Arc<Shared>,
}

impl GatewayHandle {
    pub fn new(plan: FrequencyPlan, config: ChannelConfig, stat_records: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                plan,
                config: Mutex::new(config),
                pending_config: Mutex::new(None),
                stats: Statistics::new(stat_records),
                state: StateCell::new(),
                irq: Arc::new(IrqSlot::new()),
                debug_level: AtomicU8::new(1),
                restart_requested: AtomicBool::new(false),
            }),
        }
    }

    pub fn plan(&self) -> FrequencyPlan {
        self.shared.plan
    }

    /// Configuration currently applied to the radio.
    pub fn config(&self) -> ChannelConfig {
        *lock(&self.shared.config)
    }

    /// Request a new configuration.
    ///
    /// Validated immediately against the frequency plan; applied by the main
    /// loop once the radio is quiesced. A later request replaces an earlier
    /// one that has not been applied yet.
    pub fn set_config(&self, config: ChannelConfig) -> Result<(), ChannelError> {
        config.validate(self.shared.plan)?;
        *lock(&self.shared.pending_config) = Some(config);
        Ok(())
    }

    pub(crate) fn take_pending_config(&self) -> Option<ChannelConfig> {
        lock(&self.shared.pending_config).take()
    }

    /// Put back a configuration that could not be applied yet, unless a
    /// newer request arrived meanwhile.
    pub(crate) fn defer_pending_config(&self, config: ChannelConfig) {
        let mut pending = lock(&self.shared.pending_config);
        if pending.is_none() {
            *pending = Some(config);
        }
    }

    pub(crate) fn mirror_config(&self, config: ChannelConfig) {
        *lock(&self.shared.config) = config;
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        info!("Statistics reset");
        self.shared.stats.reset();
    }

    pub(crate) fn statistics(&self) -> &Statistics {
        &self.shared.stats
    }

    pub fn state(&self) -> RadioState {
        self.shared.state.get()
    }

    pub(crate) fn publish_state(&self, state: RadioState) {
        self.shared.state.publish(state);
    }

    /// Set the debug level (0..=4) and the global log filter with it.
    pub fn set_debug_level(&self, level: u8) {
        let level = level.min(MAX_DEBUG_LEVEL);
        self.shared.debug_level.store(level, Ordering::Relaxed);
        log::set_max_level(level_filter(level));
    }

    pub fn debug_level(&self) -> u8 {
        self.shared.debug_level.load(Ordering::Relaxed)
    }

    /// Slot the DIO interrupt handlers post to.
    pub fn irq(&self) -> Arc<IrqSlot> {
        self.shared.irq.clone()
    }

    /// Ask the firmware to restart the device (backend management request).
    pub fn request_restart(&self) {
        self.shared.restart_requested.store(true, Ordering::Release);
    }

    pub fn restart_requested(&self) -> bool {
        self.shared.restart_requested.load(Ordering::Acquire)
    }
}
