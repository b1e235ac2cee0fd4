//! Stage 3: controller dispatch (spec.md §4.3).
//!
//! Deduplicates and cooldown-gates `ChannelConfig` decisions into
//! `SET_CHANNEL` `Command`s: an actual channel change is rate-limited by
//! `change_cooldown_ms`, and repeating the same channel is rate-limited by
//! the shorter `hold_ms`. Each node's `configVersion` is a strictly
//! increasing per-node counter (spec.md §9's preferred alternative to a
//! clock-derived string).
//!
//! Grounded on `self_tune/controller.rs`'s cooldown check in `apply_pid`
//! (`now - last_adjusted < spec.cooldown` gates mutation).

use std::collections::HashMap;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::bus::Topics;
use crate::config::ControllerConfig;
use crate::types::{ChannelConfig, Command, CommandKind};

struct DispatchState {
    last_sent_channel: Option<u32>,
    last_sent_at: Option<i64>,
    last_change_at: Option<i64>,
    version_counter: u64,
}

impl DispatchState {
    fn new() -> Self {
        DispatchState {
            last_sent_channel: None,
            last_sent_at: None,
            last_change_at: None,
            version_counter: 0,
        }
    }
}

pub struct Controller {
    config: ControllerConfig,
    nodes: HashMap<String, DispatchState>,
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Self {
        Controller {
            config,
            nodes: HashMap::new(),
        }
    }

    /// Process one channel-config decision at wall-clock time `now` (epoch
    /// ms). Pure and synchronous so it's directly unit-testable; `run()`
    /// below is the async bus-driven wrapper.
    pub fn on_chconfig(&mut self, cc: &ChannelConfig, now: i64) -> Option<Command> {
        let state = self
            .nodes
            .entry(cc.node_id.clone())
            .or_insert_with(DispatchState::new);

        if let Some(last_channel) = state.last_sent_channel {
            if last_channel == cc.channel {
                if let Some(last_sent_at) = state.last_sent_at {
                    if now - last_sent_at < self.config.hold_ms {
                        debug!(
                            target: "meshplane::controller",
                            node_id = %cc.node_id,
                            channel = cc.channel,
                            "held: identical config within hold window"
                        );
                        return None;
                    }
                }
            } else if let Some(last_change_at) = state.last_change_at {
                if now - last_change_at < self.config.change_cooldown_ms {
                    debug!(
                        target: "meshplane::controller",
                        node_id = %cc.node_id,
                        channel = cc.channel,
                        "suppressed: change cooldown not elapsed"
                    );
                    return None;
                }
            }
        }

        let changed = state.last_sent_channel != Some(cc.channel);
        state.version_counter += 1;
        state.last_sent_channel = Some(cc.channel);
        state.last_sent_at = Some(now);
        if changed {
            state.last_change_at = Some(now);
        }

        Some(Command {
            node_id: cc.node_id.clone(),
            command: CommandKind::SetChannel,
            payload: cc.channel.to_string(),
            config_version: format!("v{}", state.version_counter),
        })
    }

    pub async fn run(mut self, topics: Topics, mut shutdown: broadcast::Receiver<()>) {
        let mut rx = topics.chconfigs.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(target: "meshplane::controller", "shutdown received, exiting");
                    break;
                }
                recv = rx.recv() => {
                    match recv {
                        Ok(cc) => {
                            let now = crate::now_ms();
                            if let Some(cmd) = self.on_chconfig(&cc, now) {
                                topics.commands.publish(cmd);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(target: "meshplane::controller", skipped, "chconfig receiver lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    }
}
