//! Kernel command-line parameters (§6).
//!
//! A flat `key=value` (or bare `key`) string, space-separated, with every
//! recognised key defaulting at compile time. Zero-allocation: parsing
//! happens before the heap exists, straight out of the Multiboot2 command
//! line buffer.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApicMode {
    Pic,
    FixedBsp,
    LogicalFixed,
    LogicalLowestPriority,
}

#[derive(Debug, Clone, Copy)]
pub struct BootParams {
    pub heap_validate: bool,
    pub apic: ApicMode,
    pub loglevel: log::LevelFilter,
    pub irq_log: bool,
    pub use_acpi: bool,
    pub use_msi: bool,
}

impl Default for BootParams {
    fn default() -> Self {
        Self {
            heap_validate: false,
            apic: ApicMode::LogicalFixed,
            loglevel: log::LevelFilter::Info,
            irq_log: false,
            use_acpi: true,
            use_msi: true,
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "true" | "yes" | "on")
}

fn parse_level(value: &str) -> Option<log::LevelFilter> {
    match value {
        "0" | "off" => Some(log::LevelFilter::Off),
        "1" | "error" => Some(log::LevelFilter::Error),
        "2" | "warn" => Some(log::LevelFilter::Warn),
        "3" | "info" => Some(log::LevelFilter::Info),
        "4" | "debug" => Some(log::LevelFilter::Debug),
        "5" | "trace" => Some(log::LevelFilter::Trace),
        _ => None,
    }
}

/// Parse a `key=value key2=value2 bareflag` command line. Unrecognised
/// keys and malformed values are ignored, falling back to the default —
/// a bad boot parameter should degrade, not panic the machine.
pub fn parse(cmdline: &str) -> BootParams {
    let mut params = BootParams::default();

    for token in cmdline.split_ascii_whitespace() {
        let (key, value) = match token.split_once('=') {
            Some((k, v)) => (k, v),
            None => (token, "1"),
        };

        match key {
            "heap_validate" => params.heap_validate = parse_bool(value),
            "apic" => {
                params.apic = match value {
                    "0" => ApicMode::Pic,
                    "1" => ApicMode::FixedBsp,
                    "2" => ApicMode::LogicalFixed,
                    "3" => ApicMode::LogicalLowestPriority,
                    _ => params.apic,
                }
            }
            "loglevel" => {
                if let Some(l) = parse_level(value) {
                    params.loglevel = l;
                }
            }
            "irq_log" => params.irq_log = parse_bool(value),
            "use_acpi" => params.use_acpi = parse_bool(value),
            "use_msi" => params.use_msi = parse_bool(value),
            _ => {}
        }
    }

    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_empty() {
        let params = parse("");
        assert_eq!(params.apic, ApicMode::LogicalFixed);
        assert!(!params.heap_validate);
    }

    #[test]
    fn parses_key_value_and_bare_flags() {
        let params = parse("heap_validate=1 loglevel=debug irq_log apic=0");
        assert!(params.heap_validate);
        assert_eq!(params.loglevel, log::LevelFilter::Debug);
        assert!(params.irq_log);
        assert_eq!(params.apic, ApicMode::Pic);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let params = parse("bogus=wat apic=9");
        assert_eq!(params.apic, ApicMode::LogicalFixed);
    }
}
