use std::fs;
use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum IoKind {
    DigitalInput,
    Relay,
}

impl IoKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IoKind::DigitalInput => "digitalinput",
            IoKind::Relay => "relay",
        }
    }

    /// Settings path group, e.g. `/Settings/DigitalInput/...`.
    pub fn settings_group(&self) -> &'static str {
        match self {
            IoKind::DigitalInput => "DigitalInput",
            IoKind::Relay => "Relay",
        }
    }
}

// Role ordinals are persisted; only append new entries at the end.
#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum InputRole {
    Disabled,
    PulseMeter,
    Door,
    BilgePump,
    BilgeAlarm,
    BurglarAlarm,
    SmokeAlarm,
    FireAlarm,
    Co2Alarm,
    Generator,
    GenericIo,
    TouchEnable,
}

pub const INPUT_ROLES: [InputRole; 12] = [
    InputRole::Disabled,
    InputRole::PulseMeter,
    InputRole::Door,
    InputRole::BilgePump,
    InputRole::BilgeAlarm,
    InputRole::BurglarAlarm,
    InputRole::SmokeAlarm,
    InputRole::FireAlarm,
    InputRole::Co2Alarm,
    InputRole::Generator,
    InputRole::GenericIo,
    InputRole::TouchEnable,
];

impl InputRole {
    pub fn from_id(id: u8) -> Option<Self> {
        INPUT_ROLES.get(id as usize).copied()
    }

    pub fn id(&self) -> u8 {
        INPUT_ROLES.iter().position(|r| r == self).unwrap_or(0) as u8
    }

    pub fn label(&self) -> &'static str {
        match self {
            InputRole::Disabled => "Disabled",
            InputRole::PulseMeter => "Pulse meter",
            InputRole::Door => "Door",
            InputRole::BilgePump => "Bilge pump",
            InputRole::BilgeAlarm => "Bilge alarm",
            InputRole::BurglarAlarm => "Burglar alarm",
            InputRole::SmokeAlarm => "Smoke alarm",
            InputRole::FireAlarm => "Fire alarm",
            InputRole::Co2Alarm => "CO2 alarm",
            InputRole::Generator => "Generator",
            InputRole::GenericIo => "Generic I/O",
            InputRole::TouchEnable => "Touch enable",
        }
    }
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RelayRole {
    Disabled,
    Alarm,
    GensetStartStop,
    Manual,
    TankPump,
    Temperature,
    ConnectedGensetHelper,
}

pub const RELAY_ROLES: [RelayRole; 7] = [
    RelayRole::Disabled,
    RelayRole::Alarm,
    RelayRole::GensetStartStop,
    RelayRole::Manual,
    RelayRole::TankPump,
    RelayRole::Temperature,
    RelayRole::ConnectedGensetHelper,
];

impl RelayRole {
    pub fn from_id(id: u8) -> Option<Self> {
        RELAY_ROLES.get(id as usize).copied()
    }

    pub fn id(&self) -> u8 {
        RELAY_ROLES.iter().position(|r| r == self).unwrap_or(0) as u8
    }

    pub fn label(&self) -> &'static str {
        match self {
            RelayRole::Disabled => "Disabled",
            RelayRole::Alarm => "Alarm",
            RelayRole::GensetStartStop => "Genset start stop",
            RelayRole::Manual => "Manual",
            RelayRole::TankPump => "Tank pump",
            RelayRole::Temperature => "Temperature",
            RelayRole::ConnectedGensetHelper => "Connected genset helper relay",
        }
    }
}

/// State display pairs, indexed by `state / 2` with `state % 2` picking a side.
/// The text is presentation only; translation happens in the UI.
pub const TRANSLATIONS: [(&str, &str); 6] = [
    ("low", "high"),
    ("off", "on"),
    ("no", "yes"),
    ("open", "closed"),
    ("ok", "alarm"),
    ("running", "stopped"),
];

#[derive(Debug, Clone)]
pub struct InputDecl {
    pub name: String,
    pub path: PathBuf,
    pub label: String,
    pub instance: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct RelayDecl {
    pub name: String,
    pub paths: Vec<PathBuf>,
    pub label: String,
    pub instance: Option<u32>,
}

#[derive(Debug, Clone)]
pub enum PinDecl {
    Input(InputDecl),
    Relay(RelayDecl),
}

impl PinDecl {
    pub fn name(&self) -> &str {
        match self {
            PinDecl::Input(d) => &d.name,
            PinDecl::Relay(d) => &d.name,
        }
    }

    pub fn kind(&self) -> IoKind {
        match self {
            PinDecl::Input(_) => IoKind::DigitalInput,
            PinDecl::Relay(_) => IoKind::Relay,
        }
    }

    /// Stable device identity, derived from the line path.
    pub fn devid(&self) -> String {
        let path = match self {
            PinDecl::Input(d) => &d.path,
            PinDecl::Relay(d) => d.paths.first().map(PathBuf::as_path).unwrap_or(Path::new("")),
        };
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name().to_string())
    }

    pub fn instance(&self) -> Option<u32> {
        match self {
            PinDecl::Input(d) => d.instance,
            PinDecl::Relay(d) => d.instance,
        }
    }
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Siblings of a relay path sharing its basename; picks up `_set`, `_res`
/// and `_in` coil files next to the declared one.
fn sibling_paths(path: &Path) -> Vec<PathBuf> {
    let base = basename(path);
    let Some(dir) = path.parent() else {
        return vec![path.to_path_buf()];
    };
    let Ok(entries) = fs::read_dir(dir) else {
        return vec![path.to_path_buf()];
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| basename(p).starts_with(&base))
        .collect();
    if paths.is_empty() {
        paths.push(path.to_path_buf());
    }
    paths.sort();
    paths
}

/// Parse one line-oriented config file. `tag <name>` sets a namespace
/// prefix; `input`/`relay` declare pins named `<tag>_<basename>`.
pub fn parse_config(path: &Path) -> Result<Vec<PinDecl>, AppError> {
    let contents = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("failed to read {}: {e}", path.display())))?;
    parse_config_str(&contents)
}

pub fn parse_config_str(contents: &str) -> Result<Vec<PinDecl>, AppError> {
    let mut tag: Option<String> = None;
    let mut pins = Vec::new();

    for (num, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (cmd, arg) = line
            .split_once(char::is_whitespace)
            .ok_or_else(|| AppError::Config(format!("malformed config line {}", num + 1)))?;
        let arg = arg.trim();

        match cmd {
            "tag" => tag = Some(arg.to_string()),
            "input" | "relay" => {
                let (pth, label) = arg
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| AppError::Config(format!("missing label on line {}", num + 1)))?;
                let label = label.trim().trim_matches('"').to_string();
                let path = PathBuf::from(pth);
                let tag = tag
                    .as_deref()
                    .ok_or_else(|| AppError::Config(format!("'{cmd}' before 'tag' on line {}", num + 1)))?;
                let name = format!("{tag}_{}", basename(&path));

                if cmd == "input" {
                    pins.push(PinDecl::Input(InputDecl {
                        name,
                        path,
                        label,
                        instance: None,
                    }));
                } else {
                    pins.push(PinDecl::Relay(RelayDecl {
                        name,
                        paths: sibling_paths(&path),
                        label,
                        instance: None,
                    }));
                }
            }
            other => {
                return Err(AppError::Config(format!(
                    "unknown config directive '{other}' on line {}",
                    num + 1
                )));
            }
        }
    }

    Ok(pins)
}

/// Group `--relays` arguments by the numeric id in `relay_<id>[_suffix]`
/// basenames, so set/reset/feedback lines of one relay end up together.
pub fn group_relay_paths(paths: &[PathBuf]) -> Result<Vec<RelayDecl>, AppError> {
    let mut by_id: FxHashMap<u32, Vec<PathBuf>> = FxHashMap::default();

    for path in paths {
        let base = basename(path);
        let id = base
            .split('_')
            .nth(1)
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or_else(|| AppError::Config(format!("cannot derive relay id from '{base}'")))?;
        by_id.entry(id).or_default().push(path.clone());
    }

    let mut decls: Vec<RelayDecl> = by_id
        .into_iter()
        .map(|(id, mut paths)| {
            paths.sort();
            RelayDecl {
                name: id.to_string(),
                paths,
                label: format!("Relay {id}"),
                instance: Some(id),
            }
        })
        .collect();
    decls.sort_by_key(|d| d.name.clone());
    Ok(decls)
}
