use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::{FixedOffset, Offset, Utc};

use crate::limits::*;
use crate::model::equipment_key;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    /// Display casing, as configured.
    pub name: String,
    pub capacity: u64,
}

/// Owned units per equipment type. Lookups are case-insensitive.
#[derive(Debug, Clone)]
pub struct CapacityTable {
    entries: Vec<CatalogEntry>,
    index: HashMap<String, usize>,
    default_capacity: u64,
}

impl CapacityTable {
    pub fn new<I, S>(entries: I, default_capacity: u64) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        if default_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "default_capacity",
                reason: "must be positive".into(),
            });
        }
        let mut table = Self {
            entries: Vec::new(),
            index: HashMap::new(),
            default_capacity,
        };
        for (name, capacity) in entries {
            let name: String = name.into();
            let key = equipment_key(&name);
            if key.is_empty() || name.len() > MAX_EQUIPMENT_NAME_LEN {
                return Err(ConfigError::Invalid {
                    key: "capacity",
                    reason: format!("bad equipment name {name:?}"),
                });
            }
            if capacity == 0 {
                return Err(ConfigError::Invalid {
                    key: "capacity",
                    reason: format!("{name}: capacity must be positive"),
                });
            }
            if table.index.contains_key(&key) {
                return Err(ConfigError::Invalid {
                    key: "capacity",
                    reason: format!("{name}: duplicate equipment type"),
                });
            }
            if table.entries.len() >= MAX_CATALOG_ENTRIES {
                return Err(ConfigError::Invalid {
                    key: "capacity",
                    reason: "too many equipment types".into(),
                });
            }
            table.index.insert(key, table.entries.len());
            table.entries.push(CatalogEntry { name, capacity });
        }
        Ok(table)
    }

    /// Parse a JSON object of `{"Equipment Name": capacity, ...}`.
    pub fn from_json(json: &str, default_capacity: u64) -> Result<Self, ConfigError> {
        let parsed: BTreeMap<String, u64> =
            serde_json::from_str(json).map_err(|e| ConfigError::Invalid {
                key: "capacity",
                reason: e.to_string(),
            })?;
        Self::new(parsed, default_capacity)
    }

    pub fn from_file(path: &Path, default_capacity: u64) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|e| ConfigError::Invalid {
            key: "LOANSTAT_CAPACITY_FILE",
            reason: format!("{}: {e}", path.display()),
        })?;
        Self::from_json(&json, default_capacity)
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, equipment: &str) -> Option<&CatalogEntry> {
        self.index
            .get(&equipment_key(equipment))
            .map(|&i| &self.entries[i])
    }

    pub fn contains(&self, equipment: &str) -> bool {
        self.get(equipment).is_some()
    }

    /// Configured capacity, or the default for unknown types.
    pub fn capacity_of(&self, equipment: &str) -> u64 {
        self.get(equipment)
            .map_or(self.default_capacity, |e| e.capacity)
    }

    /// Configured display name, or the name as given for unknown types.
    pub fn display_name<'a>(&'a self, equipment: &'a str) -> &'a str {
        self.get(equipment).map_or(equipment, |e| e.name.as_str())
    }

    pub fn default_capacity(&self) -> u64 {
        self.default_capacity
    }

    pub fn total_capacity(&self) -> u64 {
        self.entries.iter().map(|e| e.capacity).sum()
    }
}

/// Read-only inputs of a report, injected at the engine's entry point.
#[derive(Debug, Clone)]
pub struct ReportConfig {
    pub capacities: CapacityTable,
    /// A day is a stock-out when borrowed units reach `ratio * capacity`.
    pub stockout_ratio: f64,
    pub stockout_window_days: u32,
    pub feed_limit: usize,
    pub ranking_size: usize,
    /// Drop "most borrowed" types from the "least borrowed" list.
    pub exclusive_rankings: bool,
    /// Offset used for all calendar bucketing.
    pub utc_offset: FixedOffset,
}

impl ReportConfig {
    pub fn new(capacities: CapacityTable) -> Self {
        Self {
            capacities,
            stockout_ratio: 1.0,
            stockout_window_days: STOCKOUT_WINDOW_DAYS,
            feed_limit: DEFAULT_FEED_LIMIT,
            ranking_size: RANKING_SIZE,
            exclusive_rankings: false,
            utc_offset: utc(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from `LOANSTAT_*` variables supplied by `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let default_capacity = parse_var(&lookup, "LOANSTAT_DEFAULT_CAPACITY")?
            .unwrap_or(DEFAULT_CAPACITY);
        let capacities = match (lookup("LOANSTAT_CAPACITY"), lookup("LOANSTAT_CAPACITY_FILE")) {
            (Some(json), _) => CapacityTable::from_json(&json, default_capacity)?,
            (None, Some(path)) => CapacityTable::from_file(Path::new(&path), default_capacity)?,
            (None, None) => return Err(ConfigError::Missing("LOANSTAT_CAPACITY_FILE")),
        };

        let mut config = Self::new(capacities);
        if let Some(ratio) = parse_var::<f64>(&lookup, "LOANSTAT_STOCKOUT_RATIO")? {
            config.stockout_ratio = ratio;
        }
        if let Some(limit) = parse_var(&lookup, "LOANSTAT_FEED_LIMIT")? {
            config.feed_limit = limit;
        }
        if let Some(exclusive) = parse_var(&lookup, "LOANSTAT_EXCLUSIVE_RANKINGS")? {
            config.exclusive_rankings = exclusive;
        }
        if let Some(minutes) = parse_var::<i32>(&lookup, "LOANSTAT_UTC_OFFSET_MINUTES")? {
            config.utc_offset = offset_from_minutes(minutes)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacities.is_empty() {
            return Err(ConfigError::Invalid {
                key: "capacity",
                reason: "no equipment types configured".into(),
            });
        }
        if !self.stockout_ratio.is_finite() || self.stockout_ratio <= 0.0 {
            return Err(ConfigError::Invalid {
                key: "LOANSTAT_STOCKOUT_RATIO",
                reason: format!("{} is not a positive ratio", self.stockout_ratio),
            });
        }
        if self.feed_limit == 0 || self.feed_limit > MAX_FEED_LIMIT {
            return Err(ConfigError::Invalid {
                key: "LOANSTAT_FEED_LIMIT",
                reason: format!("must be in 1..={MAX_FEED_LIMIT}"),
            });
        }
        if self.stockout_window_days == 0 {
            return Err(ConfigError::Invalid {
                key: "stockout_window_days",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

fn utc() -> FixedOffset {
    Utc.fix()
}

pub fn offset_from_minutes(minutes: i32) -> Result<FixedOffset, ConfigError> {
    if minutes.abs() > MAX_UTC_OFFSET_MINUTES {
        return Err(ConfigError::Invalid {
            key: "LOANSTAT_UTC_OFFSET_MINUTES",
            reason: format!("{minutes} outside ±{MAX_UTC_OFFSET_MINUTES}"),
        });
    }
    FixedOffset::east_opt(minutes * 60).ok_or(ConfigError::Invalid {
        key: "LOANSTAT_UTC_OFFSET_MINUTES",
        reason: format!("{minutes} is not a valid offset"),
    })
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                key,
                reason: format!("cannot parse {raw:?}"),
            }),
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid { key: &'static str, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "missing configuration: {key}"),
            ConfigError::Invalid { key, reason } => write!(f, "invalid {key}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn capacity_lookup_is_case_insensitive() {
        let table = CapacityTable::new([("Yoga Mat", 5), ("TT", 12)], 10).unwrap();
        assert_eq!(table.capacity_of("yoga mat"), 5);
        assert_eq!(table.capacity_of("tt"), 12);
        assert_eq!(table.display_name("YOGA MAT"), "Yoga Mat");
        assert_eq!(table.total_capacity(), 17);
    }

    #[test]
    fn unknown_type_uses_default() {
        let table = CapacityTable::new([("Chess", 3)], 10).unwrap();
        assert_eq!(table.capacity_of("Carrom"), 10);
        assert_eq!(table.display_name("Carrom"), "Carrom");
        assert!(!table.contains("Carrom"));
    }

    #[test]
    fn duplicate_case_insensitive_rejected() {
        let err = CapacityTable::new([("Cycle", 7), ("cycle", 3)], 10).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn zero_capacity_rejected() {
        assert!(CapacityTable::new([("Cycle", 0)], 10).is_err());
        assert!(CapacityTable::new([("Cycle", 1)], 0).is_err());
    }

    #[test]
    fn from_json_parses_object() {
        let table = CapacityTable::from_json(r#"{"Football": 10, "Chess": 3}"#, 10).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.capacity_of("football"), 10);
    }

    #[test]
    fn from_json_rejects_garbage() {
        assert!(CapacityTable::from_json("[1, 2]", 10).is_err());
        assert!(CapacityTable::from_json(r#"{"Chess": -1}"#, 10).is_err());
    }

    #[test]
    fn missing_capacity_is_configuration_missing() {
        let err = ReportConfig::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("LOANSTAT_CAPACITY_FILE")));
    }

    #[test]
    fn from_lookup_reads_overrides() {
        let config = ReportConfig::from_lookup(lookup_from(&[
            ("LOANSTAT_CAPACITY", r#"{"Cycle": 7}"#),
            ("LOANSTAT_DEFAULT_CAPACITY", "5"),
            ("LOANSTAT_STOCKOUT_RATIO", "0.8"),
            ("LOANSTAT_FEED_LIMIT", "20"),
            ("LOANSTAT_EXCLUSIVE_RANKINGS", "true"),
            ("LOANSTAT_UTC_OFFSET_MINUTES", "330"),
        ]))
        .unwrap();
        assert_eq!(config.capacities.capacity_of("unknown"), 5);
        assert_eq!(config.stockout_ratio, 0.8);
        assert_eq!(config.feed_limit, 20);
        assert!(config.exclusive_rankings);
        assert_eq!(config.utc_offset.local_minus_utc(), 330 * 60);
    }

    #[test]
    fn from_lookup_reads_capacity_file() {
        let dir = std::env::temp_dir().join("loanstat_test_config");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("capacity.json");
        std::fs::write(&path, r#"{"Pool Stick": 5}"#).unwrap();

        let config = ReportConfig::from_lookup(lookup_from(&[(
            "LOANSTAT_CAPACITY_FILE",
            path.to_str().unwrap(),
        )]))
        .unwrap();
        assert_eq!(config.capacities.capacity_of("pool stick"), 5);
        assert_eq!(config.stockout_ratio, 1.0);
        assert_eq!(config.feed_limit, DEFAULT_FEED_LIMIT);
    }

    #[test]
    fn invalid_values_rejected() {
        let cap = ("LOANSTAT_CAPACITY", r#"{"Cycle": 7}"#);
        for bad in [
            ("LOANSTAT_STOCKOUT_RATIO", "0"),
            ("LOANSTAT_STOCKOUT_RATIO", "abc"),
            ("LOANSTAT_FEED_LIMIT", "0"),
            ("LOANSTAT_FEED_LIMIT", "5000"),
            ("LOANSTAT_UTC_OFFSET_MINUTES", "2000"),
            ("LOANSTAT_CAPACITY", "{}"),
        ] {
            let result = ReportConfig::from_lookup(lookup_from(&[cap, bad]));
            assert!(result.is_err(), "{bad:?} should be rejected");
        }
    }
}
