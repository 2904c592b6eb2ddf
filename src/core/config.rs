use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::error::{ReaderError, Result};

/// Names of the card-detect lines, indexed by `detect & 0x7f`
pub const CARD_DETECT_NAMES: [&str; 12] = [
    "cd", "dsr", "cts", "ring", "none", "gpio1", "gpio2", "gpio3", "gpio4", "gpio5", "gpio6",
    "gpio7",
];

/// First detect value naming a GPIO pin
const DETECT_GPIO_FIRST: u8 = 5;

/// Hardware family of a reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReaderType {
    /// Built-in SCI slot of a set-top box
    Internal,
    /// FTDI based smartreader
    Smart,
    /// Smargo serial reader
    Smargo,
    /// Phoenix/mouse serial reader
    #[default]
    Mouse,
    /// Any PC/SC reader
    Pcsc,
}

impl fmt::Display for ReaderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReaderType::Internal => "internal",
            ReaderType::Smart => "smartreader",
            ReaderType::Smargo => "smargo",
            ReaderType::Mouse => "mouse",
            ReaderType::Pcsc => "pcsc",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for ReaderType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "internal" => Ok(ReaderType::Internal),
            "smart" | "smartreader" => Ok(ReaderType::Smart),
            "smargo" => Ok(ReaderType::Smargo),
            "mouse" | "phoenix" => Ok(ReaderType::Mouse),
            "pcsc" => Ok(ReaderType::Pcsc),
            _ => Err(format!("Invalid reader type: {s}")),
        }
    }
}

/// Card-detect line configuration. Bit 0x80 inverts the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CardDetect(pub u8);

impl CardDetect {
    pub fn line(self) -> u8 {
        self.0 & 0x7F
    }

    pub fn inverted(self) -> bool {
        self.0 & 0x80 != 0
    }

    /// Reader reports no usable detect line, so a card is always assumed present
    pub fn always_present(self, use_gpio: bool) -> bool {
        let gpio = use_gpio && self.0 >= DETECT_GPIO_FIRST;
        !gpio && self.line() > 3
    }
}

impl fmt::Display for CardDetect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = CARD_DETECT_NAMES
            .get(self.line() as usize)
            .copied()
            .unwrap_or("?");
        write!(f, "{}{}", if self.inverted() { "!" } else { "" }, name)
    }
}

/// Configuration of one physical reader slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub label: String,
    pub device: String,
    pub reader_type: ReaderType,
    pub detect: CardDetect,
    pub use_gpio: bool,
    /// Card clock, hundredths of MHz
    pub cardmhz: u16,
    /// Interface clock, hundredths of MHz
    pub mhz: u16,
    pub autospeed: bool,
    /// Start activation in deprecated mode
    pub deprecated: bool,
    pub enabled: bool,
    /// Keep the CAID when the card is re-initialised
    pub keep_caid_on_reinit: bool,
    /// Announce local card up/ejected to peer sharing
    pub announce_local_card: bool,
    /// Attach an extended control word block to ECM answers
    pub extended_cw: bool,
    /// EMM subtypes (low 7 bits of the first byte) never sent to the card
    pub nano_mask: Vec<u8>,
    /// Offline EMM file loaded after every successful insertion
    pub emm_file: Option<PathBuf>,
    pub caid: u16,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            label: String::from("reader"),
            device: String::new(),
            reader_type: ReaderType::default(),
            detect: CardDetect::default(),
            use_gpio: false,
            cardmhz: 357,
            mhz: 357,
            autospeed: false,
            deprecated: false,
            enabled: true,
            keep_caid_on_reinit: false,
            announce_local_card: false,
            extended_cw: false,
            nano_mask: Vec::new(),
            emm_file: None,
            caid: 0,
        }
    }
}

impl ReaderConfig {
    /// Bitmap of suppressed EMM subtypes
    pub fn nano_bitmap(&self) -> u128 {
        self.nano_mask
            .iter()
            .fold(0u128, |acc, &nano| acc | (1u128 << (nano % 0x80)))
    }

    /// Smartreader or smargo protocol, the readers that negotiate clocks
    pub fn is_smart_family(&self) -> bool {
        matches!(self.reader_type, ReaderType::Smart | ReaderType::Smargo)
    }
}

/// Top level configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Detected set-top box model, used for internal reader clock overrides
    pub boxtype: Option<String>,
    pub readers: Vec<ReaderConfig>,
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)
            .map_err(|e| ReaderError::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    fn validate(&self) -> Result<()> {
        for (i, reader) in self.readers.iter().enumerate() {
            if reader.label.is_empty() {
                return Err(ReaderError::Config(format!("reader #{i} has no label")));
            }
            if self.readers[..i].iter().any(|r| r.label == reader.label) {
                return Err(ReaderError::Config(format!(
                    "duplicate reader label '{}'",
                    reader.label
                )));
            }
            if let Some(&nano) = reader.nano_mask.iter().find(|&&n| n >= 0x80) {
                return Err(ReaderError::Config(format!(
                    "reader '{}': nano {nano:#04x} out of range",
                    reader.label
                )));
            }
        }
        Ok(())
    }

    pub fn reader(&self, label: &str) -> Option<&ReaderConfig> {
        self.readers.iter().find(|r| r.label == label)
    }

    pub fn boxtype(&self) -> &str {
        self.boxtype.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_defaults() {
        let cfg = ReaderConfig::default();
        assert_eq!(cfg.cardmhz, 357);
        assert_eq!(cfg.mhz, 357);
        assert!(cfg.enabled);
        assert_eq!(cfg.detect.to_string(), "cd");
    }

    #[test]
    fn test_card_detect() {
        assert_eq!(CardDetect(0x81).to_string(), "!dsr");
        assert_eq!(CardDetect(4).to_string(), "none");
        assert!(CardDetect(4).always_present(false));
        assert!(!CardDetect(0).always_present(false));
        // GPIO line with GPIO signalling enabled goes through the transport
        assert!(!CardDetect(6).always_present(true));
        assert!(CardDetect(6).always_present(false));
        assert_eq!(CardDetect(0x7F).to_string(), "?");
    }

    #[test]
    fn test_nano_bitmap() {
        let cfg = ReaderConfig {
            nano_mask: vec![0x01, 0x42, 0x7F],
            ..Default::default()
        };
        let bitmap = cfg.nano_bitmap();
        assert_ne!(bitmap & (1 << 0x01), 0);
        assert_ne!(bitmap & (1 << 0x42), 0);
        assert_ne!(bitmap & (1 << 0x7F), 0);
        assert_eq!(bitmap.count_ones(), 3);
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "boxtype": "dm8000",
            "readers": [
                { "label": "sci0", "device": "/dev/sci0", "reader_type": "internal" },
                { "label": "usb", "device": "Serial:Reader", "reader_type": "smart",
                  "cardmhz": 600, "detect": 132, "nano_mask": [1, 2] }
            ]
        }"#;
        let config = Config::from_json(json).unwrap();
        assert_eq!(config.boxtype(), "dm8000");
        assert_eq!(config.readers.len(), 2);

        let usb = config.reader("usb").unwrap();
        assert_eq!(usb.reader_type, ReaderType::Smart);
        assert_eq!(usb.cardmhz, 600);
        assert_eq!(usb.mhz, 357);
        assert!(usb.detect.inverted());
        assert_eq!(usb.detect.line(), 4);
        assert!(config.reader("missing").is_none());
    }

    #[test]
    fn test_config_rejects_duplicates_and_bad_nanos() {
        let dup = r#"{ "readers": [ { "label": "a" }, { "label": "a" } ] }"#;
        assert!(Config::from_json(dup).is_err());

        let nano = r#"{ "readers": [ { "label": "a", "nano_mask": [128] } ] }"#;
        assert!(Config::from_json(nano).is_err());

        assert!(Config::from_json("not json").is_err());
    }

    #[test]
    fn test_reader_type_parsing() {
        assert_eq!("smart".parse::<ReaderType>().unwrap(), ReaderType::Smart);
        assert_eq!("PCSC".parse::<ReaderType>().unwrap(), ReaderType::Pcsc);
        assert!("serial".parse::<ReaderType>().is_err());
    }
}
