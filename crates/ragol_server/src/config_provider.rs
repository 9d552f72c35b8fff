//! The configuration snapshot the core consumes.
//!
//! Parsing a config file into this structure is the launcher's problem; the
//! core only ever sees a [`ShipConfig`] through a [`ConfigProvider`]. The
//! default provider fills in values suitable for local testing.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::sync::Arc;

use ragol_common::Version;

/// A named limits (legit-mode) file.
#[derive(Debug, Clone)]
pub struct LimitsEntry {
    pub name: String,
    pub filename: PathBuf,
}

/// Seasonal event pair: the lobby decoration event and the in-game event.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventPair {
    pub lobby_event: u8,
    pub game_event: u8,
}

#[derive(Debug, Clone)]
pub struct ShipConfig {
    pub name: String,
    pub shipgate_host: String,
    pub shipgate_port: u16,
    /// CA certificate for verifying the shipgate, plus our cert/key pair.
    pub shipgate_ca: PathBuf,
    pub ship_cert: PathBuf,
    pub ship_key: PathBuf,

    pub ship_addr4: Ipv4Addr,
    pub ship_addr6: Option<Ipv6Addr>,
    pub base_port: u16,
    pub blocks: u32,
    pub menu_code: u16,
    pub enable_ipv6: bool,

    /// Versions the ship refuses, expressed as shipgate login flags.
    pub shipgate_flags: u32,

    pub events: EventPair,

    pub v2_ptdata_file: Option<PathBuf>,
    pub gc_ptdata_file: Option<PathBuf>,
    pub bb_ptdata_file: Option<PathBuf>,
    pub v2_pmtdata_file: Option<PathBuf>,
    pub gc_pmtdata_file: Option<PathBuf>,
    pub bb_pmtdata_file: Option<PathBuf>,
    pub v2_rtdata_file: Option<PathBuf>,
    pub gc_rtdata_file: Option<PathBuf>,
    pub v2_map_dir: Option<PathBuf>,
    pub gc_map_dir: Option<PathBuf>,
    pub bb_map_dir: Option<PathBuf>,
    pub bb_param_dir: Option<PathBuf>,
    pub quests_dir: Option<PathBuf>,

    /// Allow +/- unit variants past the game's own restriction.
    pub pmt_norestrict_v2: bool,
    pub pmt_norestrict_gc: bool,
    pub pmt_norestrict_bb: bool,

    /// Whether rares / semi-rares drop inside quests absent a quest policy.
    pub quest_rares: bool,
    pub quest_semirares: bool,

    pub limits: Vec<LimitsEntry>,
    pub limits_default: usize,

    pub log_dir: PathBuf,
    /// Where shipgate-pushed script chunks land.
    pub scripts_dir: PathBuf,
}

impl ShipConfig {
    /// Is the given client version enabled on this ship?
    pub fn version_allowed(&self, v: Version) -> bool {
        use ragol_common::shipgate as sg;

        let flag = match v {
            Version::DcNte => sg::LOGIN_FLAG_NODCNTE,
            Version::Dcv1 => sg::LOGIN_FLAG_NOV1,
            Version::Dcv2 => sg::LOGIN_FLAG_NOV2,
            Version::PcNte | Version::Pcv2 => sg::LOGIN_FLAG_NOPC,
            Version::Gc => sg::LOGIN_FLAG_NOEP12,
            Version::Ep3 => sg::LOGIN_FLAG_NOEP3,
            Version::Xbox => sg::LOGIN_FLAG_NOXBOX,
            Version::BlueBurst => sg::LOGIN_FLAG_NOBB,
        };

        self.shipgate_flags & flag == 0
    }
}

pub trait ConfigProvider {
    fn ship_config(&self) -> Arc<ShipConfig>;
}

mod default {
    use super::*;

    pub struct DefaultConfigProvider {
        cfg: Arc<ShipConfig>,
    }

    impl DefaultConfigProvider {
        pub fn new() -> DefaultConfigProvider {
            DefaultConfigProvider {
                cfg: Arc::new(ShipConfig {
                    name: String::from("Ragol"),
                    shipgate_host: String::from("localhost"),
                    shipgate_port: 3455,
                    shipgate_ca: PathBuf::from("config/shipgate_ca.pem"),
                    ship_cert: PathBuf::from("config/ship_cert.pem"),
                    ship_key: PathBuf::from("config/ship_key.pem"),
                    ship_addr4: Ipv4Addr::LOCALHOST,
                    ship_addr6: None,
                    base_port: 12000,
                    blocks: 2,
                    menu_code: 0,
                    enable_ipv6: true,
                    shipgate_flags: 0,
                    events: EventPair::default(),
                    v2_ptdata_file: None,
                    gc_ptdata_file: None,
                    bb_ptdata_file: None,
                    v2_pmtdata_file: None,
                    gc_pmtdata_file: None,
                    bb_pmtdata_file: None,
                    v2_rtdata_file: None,
                    gc_rtdata_file: None,
                    v2_map_dir: None,
                    gc_map_dir: None,
                    bb_map_dir: None,
                    bb_param_dir: None,
                    quests_dir: None,
                    pmt_norestrict_v2: true,
                    pmt_norestrict_gc: true,
                    pmt_norestrict_bb: true,
                    quest_rares: false,
                    quest_semirares: false,
                    limits: Vec::new(),
                    limits_default: 0,
                    log_dir: PathBuf::from("logs"),
                    scripts_dir: PathBuf::from("scripts"),
                }),
            }
        }
    }

    impl ConfigProvider for DefaultConfigProvider {
        fn ship_config(&self) -> Arc<ShipConfig> {
            self.cfg.clone()
        }
    }
}

pub fn default_config_provider() -> Arc<dyn ConfigProvider + Send + Sync> {
    Arc::new(default::DefaultConfigProvider::new())
}
