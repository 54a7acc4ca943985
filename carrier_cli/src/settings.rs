use crate::error::SettingsError;
use carrier_dispatch::{AuthData, TargetEntry, TransportTarget, UsmUserData};
use libcarrier::{DomainKey, EngineId, PortModulus, RoutingRule, SoleKey, TransportDomain};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::num::NonZeroU16;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct TransportSettings {
    pub key: DomainKey,
    pub bind: SocketAddr,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct EngineSettings {
    pub id: EngineId,
    pub domain: DomainKey,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum RoutingSettings {
    Sole { key: DomainKey },
    PortModulus { modulus: u16, on_zero: DomainKey, otherwise: DomainKey },
}

impl Default for RoutingSettings {
    fn default() -> Self {
        RoutingSettings::Sole { key: DomainKey::default() }
    }
}

impl RoutingSettings {
    pub fn to_rule(&self) -> Result<Box<dyn RoutingRule>, SettingsError> {
        match self {
            RoutingSettings::Sole { key } => Ok(Box::new(SoleKey::new(key.clone()))),
            RoutingSettings::PortModulus { modulus, on_zero, otherwise } => {
                let modulus = NonZeroU16::new(*modulus).ok_or(SettingsError::ZeroModulus)?;
                Ok(Box::new(PortModulus::new(modulus, on_zero.clone(), otherwise.clone())))
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct CarrierSettings {
    pub transports: Vec<TransportSettings>,
    pub engines: Vec<EngineSettings>,
    #[serde(default)]
    pub routing: RoutingSettings,
    #[serde(default)]
    pub targets: Vec<TargetEntry>,
}

impl CarrierSettings {
    pub fn try_load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, SettingsError> {
        let settings = load_config_file(path)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), SettingsError> {
        save_config_file(path, self)
    }

    /// Two transports routed on the peer port, with one engine each.
    pub fn starter() -> Self {
        let any: SocketAddr = SocketAddr::from(([0, 0, 0, 0], 0));
        Self {
            transports: vec![
                TransportSettings { key: "A".into(), bind: any },
                TransportSettings { key: "B".into(), bind: any },
            ],
            engines: vec![
                EngineSettings { id: EngineId::random(), domain: "A".into() },
                EngineSettings { id: EngineId::random(), domain: "B".into() },
            ],
            routing: RoutingSettings::PortModulus { modulus: 3, on_zero: "A".into(), otherwise: "B".into() },
            targets: vec![
                TargetEntry { auth: AuthData::community("public"), transport: TransportTarget::new("localhost", 1162) },
                TargetEntry {
                    auth: AuthData::Usm(UsmUserData::new(
                        "usr-md5-des",
                        Some("authkey1".into()),
                        Some("privkey1".into()),
                    )),
                    transport: TransportTarget::new("localhost", 162).with_timeout(Duration::from_secs(5)),
                },
            ],
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let mut keys = HashSet::new();
        for t in &self.transports {
            if !keys.insert(&t.key) {
                return Err(SettingsError::DuplicateTransport(t.key.clone()));
            }
        }
        if let Some(e) = self.engines.iter().find(|e| !keys.contains(&e.domain)) {
            return Err(SettingsError::MissingTransport(e.id.clone(), e.domain.clone()));
        }
        self.routing.to_rule()?;
        Ok(())
    }

    /// The engine that talks to `peer`: the first engine on the key the routing rule assigns to the peer, so that
    /// its replies come back to the same engine.
    pub fn engine_for(&self, rule: &dyn RoutingRule, peer: &SocketAddr) -> Option<&EngineSettings> {
        let key = rule.route(TransportDomain::for_address(peer), peer, &[]);
        self.engines.iter().find(|e| e.domain == key)
    }
}

pub fn default_config_path() -> PathBuf {
    let mut home = std::env::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.push(".carrier");
    home.push("config.yml");
    home
}

pub fn load_config_file<P: AsRef<Path>>(path: Option<P>) -> Result<CarrierSettings, SettingsError> {
    let path = path.map(|p| p.as_ref().to_path_buf()).unwrap_or_else(default_config_path);
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    let settings = serde_yml::from_reader(reader)?;
    Ok(settings)
}

pub fn save_config_file<P: AsRef<Path>>(path: P, settings: &CarrierSettings) -> Result<(), SettingsError> {
    // Create directory path if required
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    let writer = std::io::BufWriter::new(file);
    serde_yml::to_writer(writer, settings)?;
    Ok(())
}
