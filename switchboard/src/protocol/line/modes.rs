//! Mode-delta parsing.

use crate::events::ChannelModeValue;
use std::collections::{BTreeSet, HashMap};

/// Which directions of a channel mode consume a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeParams {
    /// Consumes a parameter when set.
    pub on_add: bool,
    /// Consumes a parameter when unset.
    pub on_remove: bool,
}

impl ModeParams {
    const ALWAYS: Self = Self {
        on_add: true,
        on_remove: true,
    };
    const ON_SET: Self = Self {
        on_add: true,
        on_remove: false,
    };
    const NEVER: Self = Self {
        on_add: false,
        on_remove: false,
    };
}

/// Per-network table of channel modes and their parameter rules.
#[derive(Debug, Clone)]
pub struct ModeTable {
    modes: HashMap<char, ModeParams>,
}

impl Default for ModeTable {
    fn default() -> Self {
        let mut modes = HashMap::new();
        for m in ['b', 'e', 'I', 'k', 'o', 'v', 'h'] {
            modes.insert(m, ModeParams::ALWAYS);
        }
        for m in ['l', 'j', 'f'] {
            modes.insert(m, ModeParams::ON_SET);
        }
        Self { modes }
    }
}

impl ModeTable {
    /// The common baseline most networks share.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parameter rules for `mode`. Unknown modes take no parameter.
    #[must_use]
    pub fn params(&self, mode: char) -> ModeParams {
        self.modes.get(&mode).copied().unwrap_or(ModeParams::NEVER)
    }

    /// Whether `mode` consumes a parameter in the given direction.
    #[must_use]
    pub fn takes_param(&self, mode: char, adding: bool) -> bool {
        let p = self.params(mode);
        if adding { p.on_add } else { p.on_remove }
    }

    /// Override the rules for one mode.
    pub fn set(&mut self, mode: char, params: ModeParams) {
        self.modes.insert(mode, params);
    }

    /// Update from one ISUPPORT token. Returns whether it was understood.
    ///
    /// `CHANMODES=A,B,C,D`: A and B always take a parameter, C only when
    /// set, D never. `PREFIX=(ov)@+`: the listed modes always take one.
    pub fn apply_isupport(&mut self, token: &str) -> bool {
        if let Some(value) = token.strip_prefix("CHANMODES=") {
            for (idx, group) in value.split(',').enumerate() {
                let rule = match idx {
                    0 | 1 => ModeParams::ALWAYS,
                    2 => ModeParams::ON_SET,
                    _ => ModeParams::NEVER,
                };
                for m in group.chars() {
                    self.set(m, rule);
                }
            }
            true
        } else if let Some(value) = token.strip_prefix("PREFIX=") {
            let Some(letters) = value
                .strip_prefix('(')
                .and_then(|v| v.split_once(')'))
                .map(|(letters, _)| letters)
            else {
                return false;
            };
            for m in letters.chars() {
                self.set(m, ModeParams::ALWAYS);
            }
            true
        } else {
            false
        }
    }

    /// Walk a channel mode string, pairing parameterised modes with their
    /// arguments in order.
    #[must_use]
    pub fn parse_channel_modes(
        &self,
        modes: &str,
        args: &[&str],
    ) -> (Vec<ChannelModeValue>, Vec<ChannelModeValue>) {
        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut adding = true;
        let mut args = args.iter();

        for c in modes.chars() {
            match c {
                '+' => adding = true,
                '-' => adding = false,
                mode => {
                    let value = if self.takes_param(mode, adding) {
                        args.next().map(|a| (*a).to_string())
                    } else {
                        None
                    };
                    let entry = ChannelModeValue::new(mode, value);
                    if adding {
                        added.push(entry);
                    } else {
                        removed.push(entry);
                    }
                }
            }
        }
        (added, removed)
    }
}

/// Bucket a user mode string into added and removed letters.
#[must_use]
pub fn parse_user_modes(modes: &str) -> (BTreeSet<char>, BTreeSet<char>) {
    let mut added = BTreeSet::new();
    let mut removed = BTreeSet::new();
    let mut adding = true;
    for c in modes.chars() {
        match c {
            '+' => adding = true,
            '-' => adding = false,
            mode if adding => {
                added.insert(mode);
            }
            mode => {
                removed.insert(mode);
            }
        }
    }
    (added, removed)
}
