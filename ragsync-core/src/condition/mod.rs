//! Condition gate: may a run start right now?
//!
//! The gate is a pure function of an environment snapshot. Probing is bounded
//! in time and fails open: anything that cannot be determined counts as
//! awake and on mains power.

use crate::models::RunMode;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound on a single environment probe
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerSource {
    Mains,
    Battery,
    Unknown,
}

/// What the probe could observe about the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnvironmentSnapshot {
    pub power: PowerSource,
    /// `None` when sleep state cannot be queried
    pub awake: Option<bool>,
}

impl EnvironmentSnapshot {
    pub fn unknown() -> Self {
        Self {
            power: PowerSource::Unknown,
            awake: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateDecision {
    pub allowed: bool,
    pub reason: String,
}

impl GateDecision {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Source of environment snapshots
#[async_trait]
pub trait PowerProbe: Send + Sync {
    async fn snapshot(&self) -> EnvironmentSnapshot;
}

pub struct ConditionGate {
    probe: Arc<dyn PowerProbe>,
    timeout: Duration,
}

impl ConditionGate {
    pub fn new(probe: Arc<dyn PowerProbe>) -> Self {
        Self {
            probe,
            timeout: PROBE_TIMEOUT,
        }
    }

    /// Gate backed by the host system
    pub fn system() -> Self {
        Self::new(Arc::new(SystemProbe))
    }

    pub async fn evaluate(&self, mode: &RunMode) -> GateDecision {
        let snapshot = match tokio::time::timeout(self.timeout, self.probe.snapshot()).await {
            Ok(snapshot) => snapshot,
            Err(_) => {
                warn!("Environment probe timed out, assuming awake and powered");
                EnvironmentSnapshot::unknown()
            }
        };
        let decision = decide(mode, snapshot);
        debug!(mode = %mode, allowed = decision.allowed, "{}", decision.reason);
        decision
    }
}

/// Apply a run mode to a snapshot
pub fn decide(mode: &RunMode, snapshot: EnvironmentSnapshot) -> GateDecision {
    match mode {
        RunMode::AlwaysIfAwake => match snapshot.awake {
            Some(false) => GateDecision::deny("device is asleep"),
            Some(true) => GateDecision::allow("device is awake"),
            None => GateDecision::allow("sleep state unknown, assuming awake"),
        },
        RunMode::OnlyIfPowered => match snapshot.power {
            PowerSource::Battery => GateDecision::deny("running on battery"),
            PowerSource::Mains => GateDecision::allow("on mains power"),
            PowerSource::Unknown => GateDecision::allow("power source unknown, proceeding"),
        },
        RunMode::Unrecognized(raw) => {
            warn!("Unrecognized run mode '{}'", raw);
            GateDecision::allow("unrecognized mode, proceeding")
        }
    }
}

/// Probe that asks the host operating system.
///
/// The daemon only executes while the device is awake, so a completed probe
/// always reports `awake = Some(true)`.
pub struct SystemProbe;

#[async_trait]
impl PowerProbe for SystemProbe {
    async fn snapshot(&self) -> EnvironmentSnapshot {
        EnvironmentSnapshot {
            power: system_power().await,
            awake: Some(true),
        }
    }
}

#[cfg(target_os = "macos")]
async fn system_power() -> PowerSource {
    let output = tokio::process::Command::new("pmset")
        .args(["-g", "batt"])
        .kill_on_drop(true)
        .output()
        .await;
    match output {
        Ok(out) => parse_pmset(&String::from_utf8_lossy(&out.stdout)),
        Err(e) => {
            warn!("pmset failed: {}", e);
            PowerSource::Unknown
        }
    }
}

#[cfg(target_os = "linux")]
async fn system_power() -> PowerSource {
    read_power_supply(std::path::Path::new("/sys/class/power_supply")).await
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
async fn system_power() -> PowerSource {
    PowerSource::Unknown
}

/// Interpret `pmset -g batt` output
pub fn parse_pmset(output: &str) -> PowerSource {
    let lower = output.to_lowercase();
    if lower.contains("ac power") {
        PowerSource::Mains
    } else if lower.contains("battery power") || lower.contains("discharging") {
        PowerSource::Battery
    } else {
        PowerSource::Unknown
    }
}

/// Inspect a sysfs `power_supply` directory.
///
/// Any online mains adapter wins; otherwise a discharging battery means
/// battery power. Supplies scoped to a device (a wireless mouse, a headset)
/// do not power the system and are ignored.
pub async fn read_power_supply(root: &std::path::Path) -> PowerSource {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(_) => return PowerSource::Unknown,
    };

    let mut saw_battery = false;
    let mut saw_mains = false;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let dir = entry.path();
        if read_trimmed(&dir.join("scope")).await.as_deref() == Some("Device") {
            continue;
        }
        let kind = read_trimmed(&dir.join("type")).await.unwrap_or_default();
        match kind.as_str() {
            "Mains" | "USB" => {
                saw_mains = true;
                if read_trimmed(&dir.join("online")).await.as_deref() == Some("1") {
                    return PowerSource::Mains;
                }
            }
            "Battery" => {
                if read_trimmed(&dir.join("status")).await.as_deref() == Some("Discharging") {
                    saw_battery = true;
                }
            }
            _ => {}
        }
    }

    if saw_battery || saw_mains {
        PowerSource::Battery
    } else {
        PowerSource::Unknown
    }
}

async fn read_trimmed(path: &std::path::Path) -> Option<String> {
    tokio::fs::read_to_string(path)
        .await
        .ok()
        .map(|s| s.trim().to_string())
}

/// Fixed snapshot, for tests and headless hosts
pub struct StaticProbe(pub EnvironmentSnapshot);

#[async_trait]
impl PowerProbe for StaticProbe {
    async fn snapshot(&self) -> EnvironmentSnapshot {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(power: PowerSource, awake: Option<bool>) -> EnvironmentSnapshot {
        EnvironmentSnapshot { power, awake }
    }

    #[test]
    fn test_powered_mode() {
        assert!(!decide(&RunMode::OnlyIfPowered, snap(PowerSource::Battery, Some(true))).allowed);
        assert!(decide(&RunMode::OnlyIfPowered, snap(PowerSource::Mains, Some(true))).allowed);
        // Fails open
        assert!(decide(&RunMode::OnlyIfPowered, EnvironmentSnapshot::unknown()).allowed);
    }

    #[test]
    fn test_awake_mode_ignores_power() {
        assert!(decide(&RunMode::AlwaysIfAwake, snap(PowerSource::Battery, Some(true))).allowed);
        assert!(decide(&RunMode::AlwaysIfAwake, snap(PowerSource::Battery, None)).allowed);
        assert!(!decide(&RunMode::AlwaysIfAwake, snap(PowerSource::Mains, Some(false))).allowed);
    }

    #[test]
    fn test_unknown_mode_fails_open() {
        let decision = decide(
            &RunMode::Unrecognized("moonlight".into()),
            snap(PowerSource::Battery, Some(false)),
        );
        assert!(decision.allowed);
        assert_eq!(decision.reason, "unrecognized mode, proceeding");
    }

    #[test]
    fn test_parse_pmset() {
        let ac = "Now drawing from 'AC Power'\n -InternalBattery-0 100%; charged;";
        let batt = "Now drawing from 'Battery Power'\n -InternalBattery-0 80%; discharging;";
        assert_eq!(parse_pmset(ac), PowerSource::Mains);
        assert_eq!(parse_pmset(batt), PowerSource::Battery);
        assert_eq!(parse_pmset(""), PowerSource::Unknown);
    }

    #[tokio::test]
    async fn test_sysfs_power_supply() {
        let dir = tempfile::tempdir().unwrap();
        let ac = dir.path().join("AC");
        let bat = dir.path().join("BAT0");
        std::fs::create_dir_all(&ac).unwrap();
        std::fs::create_dir_all(&bat).unwrap();
        std::fs::write(ac.join("type"), "Mains\n").unwrap();
        std::fs::write(ac.join("online"), "0\n").unwrap();
        std::fs::write(bat.join("type"), "Battery\n").unwrap();
        std::fs::write(bat.join("status"), "Discharging\n").unwrap();
        assert_eq!(read_power_supply(dir.path()).await, PowerSource::Battery);

        std::fs::write(ac.join("online"), "1\n").unwrap();
        assert_eq!(read_power_supply(dir.path()).await, PowerSource::Mains);

        let empty = tempfile::tempdir().unwrap();
        assert_eq!(read_power_supply(empty.path()).await, PowerSource::Unknown);
    }

    #[tokio::test]
    async fn test_peripheral_battery_is_ignored() {
        // Desktop: no system battery, a discharging wireless mouse
        let dir = tempfile::tempdir().unwrap();
        let mouse = dir.path().join("hidpp_battery_0");
        std::fs::create_dir_all(&mouse).unwrap();
        std::fs::write(mouse.join("type"), "Battery\n").unwrap();
        std::fs::write(mouse.join("scope"), "Device\n").unwrap();
        std::fs::write(mouse.join("status"), "Discharging\n").unwrap();
        assert_eq!(read_power_supply(dir.path()).await, PowerSource::Unknown);

        let bat = dir.path().join("BAT0");
        std::fs::create_dir_all(&bat).unwrap();
        std::fs::write(bat.join("type"), "Battery\n").unwrap();
        std::fs::write(bat.join("scope"), "System\n").unwrap();
        std::fs::write(bat.join("status"), "Discharging\n").unwrap();
        assert_eq!(read_power_supply(dir.path()).await, PowerSource::Battery);
    }

    struct SlowProbe;

    #[async_trait]
    impl PowerProbe for SlowProbe {
        async fn snapshot(&self) -> EnvironmentSnapshot {
            tokio::time::sleep(Duration::from_secs(5)).await;
            EnvironmentSnapshot {
                power: PowerSource::Battery,
                awake: Some(false),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_probe_fails_open() {
        let gate = ConditionGate::new(Arc::new(SlowProbe));
        let decision = gate.evaluate(&RunMode::OnlyIfPowered).await;
        assert!(decision.allowed);
    }
}
