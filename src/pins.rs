use std::fs;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

const CPUINFO_PATH: &str = "/proc/cpuinfo";

/// Highest Broadcom GPIO number addressable on the SoC.
pub const MAX_BCM_GPIO: u32 = 53;

// Board header pin -> Broadcom GPIO, -1 for power, ground and unwired pins.
const PIN_TO_GPIO_REV1: [i8; 41] = [
    -1, -1, -1, 0, -1, 1, -1, 4, 14, -1, 15, 17, 18, 21, -1, 22, 23, -1, 24, 10, -1, 9, 25, 11, 8,
    -1, 7, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1,
];
const PIN_TO_GPIO_REV2: [i8; 41] = [
    -1, -1, -1, 2, -1, 3, -1, 4, 14, -1, 15, 17, 18, 27, -1, 22, 23, -1, 24, 10, -1, 9, 25, 11, 8,
    -1, 7, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1,
];
const PIN_TO_GPIO_REV3: [i8; 41] = [
    -1, -1, -1, 2, -1, 3, -1, 4, 14, -1, 15, 17, 18, 27, -1, 22, 23, -1, 24, 10, -1, 9, 25, 11, 8,
    -1, 7, -1, -1, 5, -1, 6, 12, 13, -1, 19, 16, 26, 20, -1, 21,
];

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NumberingMode {
    #[default]
    Unset,
    Board,
    Bcm,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BoardRevision {
    Rev1,
    Rev2,
    /// 40-pin header boards (B+, A+ and later).
    Rev3,
    ComputeModule,
}

impl BoardRevision {
    /// Reads the revision code from `/proc/cpuinfo`, assuming a 40-pin
    /// header when the host does not report one.
    pub fn detect() -> Self {
        match fs::read_to_string(CPUINFO_PATH) {
            Ok(text) => Self::from_cpuinfo(&text).unwrap_or_else(|| {
                warn!("no board revision in {CPUINFO_PATH}, assuming a 40-pin header");
                BoardRevision::Rev3
            }),
            Err(e) => {
                warn!("cannot read {CPUINFO_PATH}: {e}, assuming a 40-pin header");
                BoardRevision::Rev3
            }
        }
    }

    pub fn from_cpuinfo(text: &str) -> Option<Self> {
        let raw = text.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            (key.trim() == "Revision").then(|| value.trim().to_ascii_lowercase())
        })?;
        if raw.is_empty() {
            return None;
        }

        // leading digits flag over-volting, only the last four identify the board
        let code = &raw[raw.len().saturating_sub(4)..];
        Some(match code {
            "0002" | "0003" => BoardRevision::Rev1,
            "0004" | "0005" | "0006" | "0007" | "0008" | "0009" | "000d" | "000e" | "000f" => {
                BoardRevision::Rev2
            }
            "0011" => BoardRevision::ComputeModule,
            _ => BoardRevision::Rev3,
        })
    }

    fn header_table(&self) -> Option<&'static [i8; 41]> {
        match self {
            BoardRevision::Rev1 => Some(&PIN_TO_GPIO_REV1),
            BoardRevision::Rev2 => Some(&PIN_TO_GPIO_REV2),
            BoardRevision::Rev3 => Some(&PIN_TO_GPIO_REV3),
            BoardRevision::ComputeModule => None,
        }
    }

    fn header_pins(&self) -> u32 {
        match self {
            BoardRevision::Rev3 => 40,
            _ => 26,
        }
    }
}

/// Maps user-facing channel numbers onto kernel GPIO numbers.
#[derive(Debug, Clone, Copy)]
pub struct PinResolver {
    mode: NumberingMode,
    revision: BoardRevision,
}

impl PinResolver {
    pub fn new(revision: BoardRevision) -> Self {
        Self {
            mode: NumberingMode::Unset,
            revision,
        }
    }

    pub fn mode(&self) -> NumberingMode {
        self.mode
    }

    pub fn revision(&self) -> BoardRevision {
        self.revision
    }

    pub fn set_mode(&mut self, mode: NumberingMode) -> Result<(), AppError> {
        match mode {
            NumberingMode::Unset => Err(AppError::InvalidValue(
                "numbering mode must be board or bcm".into(),
            )),
            NumberingMode::Board if self.revision == BoardRevision::ComputeModule => {
                Err(AppError::InvalidState(
                    "board numbering is not applicable on a compute module".into(),
                ))
            }
            _ => {
                self.mode = mode;
                Ok(())
            }
        }
    }

    pub fn resolve(&self, channel: u32) -> Result<u32, AppError> {
        match self.mode {
            NumberingMode::Unset => Err(AppError::NumberingNotSet),
            NumberingMode::Bcm => {
                if channel > MAX_BCM_GPIO {
                    return Err(AppError::InvalidChannel(channel));
                }
                Ok(channel)
            }
            NumberingMode::Board => {
                if channel < 1 || channel > self.revision.header_pins() {
                    return Err(AppError::InvalidChannel(channel));
                }
                let table = self
                    .revision
                    .header_table()
                    .ok_or(AppError::InvalidChannel(channel))?;
                u32::try_from(table[channel as usize]).map_err(|_| AppError::InvalidChannel(channel))
            }
        }
    }
}
