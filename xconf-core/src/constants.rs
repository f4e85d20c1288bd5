//! Constants for the Xconf cache engine
//!
//! Table names, the static DAO id table, storage layout constants and
//! configuration defaults live here so they are easy to find and test.

// ============================================================================
// TABLES
// ============================================================================

/// Append-only changed-keys audit log shared by all instances.
pub const CHANGED_KEYS_TABLE: &str = "XconfChangedKeys4";

pub const TABLE_ENVIRONMENT: &str = "Environment";
pub const TABLE_MODEL: &str = "Model";
pub const TABLE_IP_ADDRESS_GROUP: &str = "IpAddressGroupExtended";
pub const TABLE_NAMED_LIST: &str = "GenericXconfNamedList";
pub const TABLE_FIRMWARE_CONFIG: &str = "FirmwareConfig";
pub const TABLE_FIRMWARE_RULE: &str = "FirmwareRule4";
pub const TABLE_FIRMWARE_RULE_TEMPLATE: &str = "FirmwareRuleTemplate";
pub const TABLE_SINGLETON_FILTER_VALUE: &str = "SingletonFilterValue";
pub const TABLE_DCM_RULE: &str = "DcmRule";
pub const TABLE_DEVICE_SETTINGS: &str = "DeviceSettings2";
pub const TABLE_LOG_UPLOAD_SETTINGS: &str = "LogUploadSettings2";
pub const TABLE_UPLOAD_REPOSITORY: &str = "UploadRepository";
pub const TABLE_LOG_FILE: &str = "LogFile";
pub const TABLE_LOG_FILE_LIST: &str = "LogFileList";
pub const TABLE_VOD_SETTINGS: &str = "VodSettings2";
pub const TABLE_FEATURE: &str = "XconfFeature";
pub const TABLE_FEATURE_CONTROL_RULE: &str = "FeatureControlRule2";
pub const TABLE_TELEMETRY: &str = "Telemetry";
pub const TABLE_TELEMETRY_RULES: &str = "TelemetryRules";
pub const TABLE_TELEMETRY_TWO_PROFILES: &str = "TelemetryTwoProfiles";
pub const TABLE_TELEMETRY_TWO_RULES: &str = "TelemetryTwoRules";
pub const TABLE_SETTING_PROFILES: &str = "SettingProfiles";
pub const TABLE_SETTING_RULES: &str = "SettingRules";
pub const TABLE_APPROVED_CHANGE: &str = "XconfApprovedChange";
pub const TABLE_CHANGE: &str = "XconfChange";

/// Stable per-table DAO ids, used to detect schema drift in audit records.
const DAO_IDS: &[(&str, i32)] = &[
    (TABLE_ENVIRONMENT, -1_239_402_817),
    (TABLE_MODEL, 1_163_587_014),
    (TABLE_IP_ADDRESS_GROUP, -1_881_227_442),
    (TABLE_NAMED_LIST, 1_520_003_817),
    (TABLE_FIRMWARE_CONFIG, -683_451_290),
    (TABLE_FIRMWARE_RULE, 309_226_785),
    (TABLE_FIRMWARE_RULE_TEMPLATE, -2_020_611_153),
    (TABLE_SINGLETON_FILTER_VALUE, 874_510_062),
    (TABLE_DCM_RULE, -95_318_776),
    (TABLE_DEVICE_SETTINGS, 1_467_033_211),
    (TABLE_LOG_UPLOAD_SETTINGS, -1_302_885_574),
    (TABLE_UPLOAD_REPOSITORY, 590_127_438),
    (TABLE_LOG_FILE, -417_709_950),
    (TABLE_LOG_FILE_LIST, 1_958_464_120),
    (TABLE_VOD_SETTINGS, -754_229_613),
    (TABLE_FEATURE, 226_937_745),
    (TABLE_FEATURE_CONTROL_RULE, -1_640_078_229),
    (TABLE_TELEMETRY, 1_045_592_369),
    (TABLE_TELEMETRY_RULES, -312_806_447),
    (TABLE_TELEMETRY_TWO_PROFILES, 713_455_908),
    (TABLE_TELEMETRY_TWO_RULES, -1_127_344_560),
    (TABLE_SETTING_PROFILES, 1_689_120_377),
    (TABLE_SETTING_RULES, -508_943_162),
    (TABLE_APPROVED_CHANGE, 402_716_853),
    (TABLE_CHANGE, -1_776_250_391),
    (CHANGED_KEYS_TABLE, 1_096_303_455),
];

/// Look up the static DAO id of a known table.
pub fn dao_id_for(table: &str) -> Option<i32> {
    DAO_IDS
        .iter()
        .find(|(name, _)| *name == table)
        .map(|(_, id)| *id)
}

// ============================================================================
// STORAGE LAYOUT
// ============================================================================

/// Default name of the secondary-key column of two-key tables.
pub const DEFAULT_KEY2_FIELD_NAME: &str = "column1";

/// Size of one compressed chunk (64 KiB).
pub const COMPRESSED_CHUNK_SIZE: usize = 64 * 1024;

/// Secondary key of the record holding the number of compressed chunks.
pub const COMPRESSED_PARTS_COUNT_KEY: &str = "NamedListData_parts_count";

/// Prefix of the secondary key of each compressed chunk.
pub const COMPRESSED_PART_KEY_PREFIX: &str = "NamedListData_part_";

/// Secondary key of compressed chunk `index`.
pub fn compressed_part_key(index: usize) -> String {
    format!("{}{}", COMPRESSED_PART_KEY_PREFIX, index)
}

// ============================================================================
// CACHE SETTINGS DEFAULTS
// ============================================================================

pub const DEFAULT_TICK_DURATION_MS: u64 = 60_000;
pub const DEFAULT_RETRY_COUNT_UNTIL_FULL_REFRESH: u32 = 10;
pub const DEFAULT_CHANGED_KEYS_TIME_WINDOW_MS: i64 = 900_000;
pub const DEFAULT_RELOAD_CACHE_ENTRIES: bool = false;
pub const DEFAULT_RELOAD_CACHE_ENTRIES_TIMEOUT: u64 = 1;
pub const DEFAULT_RELOAD_CACHE_ENTRIES_TIME_UNIT: &str = "DAYS";
pub const DEFAULT_CLONE_DATA_ENABLED: bool = false;
pub const DEFAULT_APPLICATION_CACHE_ENABLED: bool = true;
pub const DEFAULT_AUDIT_LOG_QUEUE_SIZE: usize = 10_000;
pub const DEFAULT_AUDIT_LOG_WORKERS: usize = 4;
pub const DEFAULT_AUDIT_USER_NAME: &str = "xconf";

/// Prefix of environment variables overriding cache settings.
pub const ENV_PREFIX: &str = "XCONF_";
