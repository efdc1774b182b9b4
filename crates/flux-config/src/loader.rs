use anyhow::{anyhow, Result};
use config::{Config, Environment, File, FileFormat, Map};
use std::path::{Path, PathBuf};

use crate::GatewayConfig;

/// 环境变量前缀，例如 `FLUX_GB28181_SIP__BIND_ADDR`
pub const ENV_PREFIX: &str = "FLUX_GB28181";

/// 配置加载器
pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    /// 创建配置加载器
    pub fn new<P: AsRef<Path>>(config_dir: P) -> Self {
        Self {
            config_dir: config_dir.as_ref().to_path_buf(),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join("gateway.toml")
    }

    /// 加载网关配置：文件（可缺省）+ 环境变量覆盖
    pub fn load_gateway(&self) -> Result<GatewayConfig> {
        self.load_with_env(None)
    }

    /// 环境变量一律按字符串读取，数值字段由 serde 转换
    fn load_with_env(&self, env: Option<Map<String, String>>) -> Result<GatewayConfig> {
        let config_path = self.config_path();
        let mut builder = Config::builder();

        // 配置文件不存在时使用默认配置
        if config_path.exists() {
            builder = builder.add_source(File::new(
                config_path.to_str().ok_or_else(|| anyhow!("Invalid config path"))?,
                FileFormat::Toml,
            ));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .source(env),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// 验证配置
    pub fn validate(&self) -> Result<GatewayConfig> {
        let config = self.load_gateway()?;
        validate_config(&config)?;
        Ok(config)
    }
}

/// 校验已加载的配置
pub fn validate_config(config: &GatewayConfig) -> Result<()> {
    if config.sip.queue_capacity == 0 {
        return Err(anyhow!("sip.queue_capacity must be greater than 0"));
    }

    if config.sip.response_timeout_secs == 0 {
        return Err(anyhow!("sip.response_timeout_secs must be greater than 0"));
    }

    if config.streams.sweep_interval_secs == 0 {
        return Err(anyhow!("streams.sweep_interval_secs must be greater than 0"));
    }

    if config.sip.max_concurrent_handlers == Some(0) {
        return Err(anyhow!("sip.max_concurrent_handlers must be greater than 0 when set"));
    }

    Ok(())
}
