//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DUEL__*` 覆盖（双下划线表示嵌套，如 `DUEL__TARGETING__MAX_ATTEMPTS=3`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::SchedulerConfig;
use crate::targeting::TargetingConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub targeting: TargetingSection,
}

/// [scheduler] 段：CancelAll 超时、历史条数、事件缓冲
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    /// CancelAll 等待当前任务停止的上限（毫秒）
    #[serde(default = "default_cancel_all_timeout_ms")]
    pub cancel_all_timeout_ms: u64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            cancel_all_timeout_ms: default_cancel_all_timeout_ms(),
            history_limit: default_history_limit(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_cancel_all_timeout_ms() -> u64 {
    2000
}

fn default_history_limit() -> usize {
    32
}

fn default_event_capacity() -> usize {
    64
}

/// [targeting] 段：重试预算与单次选择超时
#[derive(Debug, Clone, Deserialize)]
pub struct TargetingSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 单次选择超时（毫秒）；交互玩家的思考时间上限
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    #[serde(default = "default_fallback_attempts")]
    pub fallback_attempts: u32,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for TargetingSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            fallback_attempts: default_fallback_attempts(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_max_attempts() -> u32 {
    2
}

fn default_attempt_timeout_ms() -> u64 {
    15_000
}

fn default_fallback_attempts() -> u32 {
    1
}

impl AppConfig {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::from(self)
    }

    pub fn targeting_config(&self) -> TargetingConfig {
        TargetingConfig::from(self)
    }
}

impl From<&AppConfig> for SchedulerConfig {
    fn from(config: &AppConfig) -> Self {
        let section = &config.scheduler;
        SchedulerConfig::new()
            .with_cancel_all_timeout(Duration::from_millis(section.cancel_all_timeout_ms))
            .with_history_limit(section.history_limit)
            .with_event_capacity(section.event_capacity)
    }
}

impl From<&AppConfig> for TargetingConfig {
    fn from(config: &AppConfig) -> Self {
        let section = &config.targeting;
        TargetingConfig::new()
            .with_max_attempts(section.max_attempts)
            .with_attempt_timeout(Duration::from_millis(section.attempt_timeout_ms))
            .with_fallback_attempts(section.fallback_attempts)
            .with_event_capacity(section.event_capacity)
    }
}

/// 默认配置文件的候选位置（相对工作目录），取第一个存在的
const DEFAULT_LOCATIONS: [&str; 3] = ["config/default.toml", "../config/default.toml", "default.toml"];

fn locate_default_file() -> Option<PathBuf> {
    DEFAULT_LOCATIONS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.is_file())
}

/// 加载配置：默认文件 → 显式文件（存在时） → 环境变量 DUEL__*，后者覆盖前者
///
/// 加载后校验超时类配置，0 毫秒的超时会让每次选择或 CancelAll 立即失败，直接报错。
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let files = locate_default_file()
        .into_iter()
        .chain(config_path.filter(|path| path.is_file()));

    let builder = files.fold(config::Config::builder(), |builder, path| {
        builder.add_source(config::File::from(path).required(false))
    });

    let app: AppConfig = builder
        .add_source(
            config::Environment::with_prefix("DUEL")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;
    app.validate()?;
    Ok(app)
}

impl AppConfig {
    /// 检查无法被夹紧修正的取值
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.targeting.attempt_timeout_ms == 0 {
            return Err(config::ConfigError::Message(
                "targeting.attempt_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.scheduler.cancel_all_timeout_ms == 0 {
            return Err(config::ConfigError::Message(
                "scheduler.cancel_all_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_files() {
        let config = AppConfig::default();
        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.cancel_all_timeout, Duration::from_secs(2));
        assert_eq!(scheduler.history_limit, 32);

        let targeting = config.targeting_config();
        assert_eq!(targeting.max_attempts, 2);
        assert_eq!(targeting.fallback_attempts, 1);
        assert_eq!(targeting.attempt_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_explicit_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[scheduler]\ncancel_all_timeout_ms = 500\n\n[targeting]\nmax_attempts = 3\nattempt_timeout_ms = 250"
        )
        .unwrap();

        let config = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.scheduler.cancel_all_timeout_ms, 500);
        assert_eq!(config.scheduler.history_limit, 32);
        assert_eq!(config.targeting.max_attempts, 3);
        assert_eq!(
            config.targeting_config().attempt_timeout,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.targeting.fallback_attempts, 1);
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[targeting]\nattempt_timeout_ms = 0").unwrap();

        let err = load_config(Some(file.path().to_path_buf())).unwrap_err();
        assert!(err.to_string().contains("attempt_timeout_ms"), "{err}");

        let mut config = AppConfig::default();
        assert!(config.validate().is_ok());
        config.scheduler.cancel_all_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_attempts_are_clamped() {
        let mut config = AppConfig::default();
        config.targeting.max_attempts = 0;
        config.scheduler.event_capacity = 0;
        assert_eq!(config.targeting_config().max_attempts, 1);
        assert_eq!(config.scheduler_config().event_capacity, 1);
    }
}
