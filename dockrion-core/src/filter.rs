//! [`EventsFilter`] — the declarative emit policy (spec §3.3).

use std::collections::HashSet;

use crate::event::EventType;

/// How `custom:<name>` events are treated.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CustomMode {
    /// No custom events pass, regardless of `allowed_configurable`.
    #[default]
    None,
    /// Every `custom:<name>` passes.
    All,
    /// Only the named customs in the explicit list pass.
    Explicit(HashSet<String>),
}

/// A declarative policy deciding, for a given run, which event types are
/// stored/delivered. `started`, `complete`, `error`, `cancelled` always pass;
/// everything else is gated by `allowed_configurable` and `custom_mode`.
#[derive(Debug, Clone)]
pub struct EventsFilter {
    allowed_configurable: HashSet<ConfigurableType>,
    custom_mode: CustomMode,
}

/// The subset of [`EventType`] that can be toggled by a filter (the
/// mandatory four are never represented here).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ConfigurableType {
    Progress,
    Checkpoint,
    Token,
    Step,
    Heartbeat,
}

impl EventsFilter {
    fn from_configurable(allowed: &[ConfigurableType], custom_mode: CustomMode) -> Self {
        Self {
            allowed_configurable: allowed.iter().copied().collect(),
            custom_mode,
        }
    }

    /// `{}` — mandatory events only.
    pub fn minimal() -> Self {
        Self::from_configurable(&[], CustomMode::None)
    }

    /// `{token, step, heartbeat}`.
    pub fn chat() -> Self {
        Self::from_configurable(
            &[ConfigurableType::Token, ConfigurableType::Step, ConfigurableType::Heartbeat],
            CustomMode::None,
        )
    }

    /// `{token, step, progress, checkpoint, heartbeat, custom:*}`.
    pub fn debug() -> Self {
        Self::from_configurable(
            &[
                ConfigurableType::Token,
                ConfigurableType::Step,
                ConfigurableType::Progress,
                ConfigurableType::Checkpoint,
                ConfigurableType::Heartbeat,
            ],
            CustomMode::All,
        )
    }

    /// Alias for [`EventsFilter::debug`] — the spec defines `debug`/`all` as the same preset.
    pub fn all() -> Self {
        Self::debug()
    }

    /// Resolves a preset name (`minimal`, `chat`, `debug`, `all`), returning
    /// `None` for anything else so the caller can fall back to an explicit list.
    pub fn from_preset_name(name: &str) -> Option<Self> {
        match name {
            "minimal" => Some(Self::minimal()),
            "chat" => Some(Self::chat()),
            "debug" | "all" => Some(Self::debug()),
            _ => None,
        }
    }

    /// Builds a filter from an explicit list of type strings (e.g. from
    /// config). Entries `custom:<name>` enable only that custom name; a bare
    /// `custom` entry enables every custom name.
    pub fn explicit(entries: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        let mut allowed = HashSet::new();
        let mut custom_mode = CustomMode::None;
        let mut explicit_customs = HashSet::new();

        for entry in entries {
            match entry.as_ref() {
                "progress" => {
                    allowed.insert(ConfigurableType::Progress);
                }
                "checkpoint" => {
                    allowed.insert(ConfigurableType::Checkpoint);
                }
                "token" => {
                    allowed.insert(ConfigurableType::Token);
                }
                "step" => {
                    allowed.insert(ConfigurableType::Step);
                }
                "heartbeat" => {
                    allowed.insert(ConfigurableType::Heartbeat);
                }
                "custom" => custom_mode = CustomMode::All,
                other => {
                    if let Some(name) = other.strip_prefix("custom:") {
                        explicit_customs.insert(name.to_string());
                    }
                }
            }
        }

        if custom_mode == CustomMode::None && !explicit_customs.is_empty() {
            custom_mode = CustomMode::Explicit(explicit_customs);
        }

        Self {
            allowed_configurable: allowed,
            custom_mode,
        }
    }

    /// `is_allowed(type)` (spec §3.3 decision rule).
    pub fn is_allowed(&self, event_type: &EventType) -> bool {
        if event_type.is_mandatory() {
            return true;
        }

        match event_type {
            EventType::Progress => self.allowed_configurable.contains(&ConfigurableType::Progress),
            EventType::Checkpoint => self.allowed_configurable.contains(&ConfigurableType::Checkpoint),
            EventType::Token => self.allowed_configurable.contains(&ConfigurableType::Token),
            EventType::Step => self.allowed_configurable.contains(&ConfigurableType::Step),
            EventType::Heartbeat => self.allowed_configurable.contains(&ConfigurableType::Heartbeat),
            EventType::Custom(name) => match &self.custom_mode {
                CustomMode::None => false,
                CustomMode::All => true,
                CustomMode::Explicit(names) => names.contains(name),
            },
            // started/complete/error/cancelled handled by is_mandatory above.
            _ => true,
        }
    }
}

impl Default for EventsFilter {
    /// The corpus-adjacent default for "reasonable streaming out of the box"
    /// is `chat`, not `minimal` — matching the `DOCKRION_EVENTS_PRESET` default in
    /// [`crate::config::CoreConfig`].
    fn default() -> Self {
        Self::chat()
    }
}
