use serde::{Deserialize, Serialize};

/// 网关配置（gateway.toml）
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub system: SystemConfig,
    pub sip: SipConfig,
    pub http: HttpConfig,
    pub streams: StreamsConfig,
    pub media: MediaConfig,
}

/// 系统配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SystemConfig {
    pub name: String,
    pub version: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            name: "FLUX GB28181 Gateway".to_string(),
            version: "1.0.0".to_string(),
        }
    }
}

/// SIP 信令配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SipConfig {
    /// UDP 监听地址
    pub bind_addr: String,

    /// 出站请求 Via 中对外宣告的主机
    pub advertised_host: Option<String>,

    /// 平台 SIP ID
    pub server_id: String,

    /// SIP 域
    pub domain: String,

    /// Digest 认证 realm，未设置时使用每条消息的随机标识
    pub realm: Option<String>,

    /// 未知设备首次注册时使用的默认密码（未设置则忽略未知设备）
    pub default_password: Option<String>,

    pub queue_capacity: usize,

    pub max_concurrent_handlers: Option<usize>,

    pub transaction_ttl_secs: u64,

    /// 出站查询等待响应的超时
    pub response_timeout_secs: u64,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5060".to_string(),
            advertised_host: None,
            server_id: "34020000002000000001".to_string(),
            domain: "3402000000".to_string(),
            realm: None,
            default_password: None,
            queue_capacity: 1024,
            max_concurrent_handlers: None,
            transaction_ttl_secs: 32,
            response_timeout_secs: 5,
        }
    }
}

/// 运维 HTTP 接口配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind_addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8081".to_string(),
        }
    }
}

/// 流会话过期配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamsConfig {
    /// 空闲超过该时长的会话被关闭
    pub idle_timeout_secs: u64,

    /// 过期扫描周期
    pub sweep_interval_secs: u64,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 300,
            sweep_interval_secs: 300,
        }
    }
}

/// 媒体转发服务配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MediaConfig {
    /// 媒体转发服务地址（未设置则不转发）
    pub relay_endpoint: Option<String>,

    pub timeout_ms: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            relay_endpoint: None,
            timeout_ms: 3000,
        }
    }
}

impl GatewayConfig {
    /// 序列化为 TOML（用于生成示例配置）
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_gateway_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.sip.bind_addr, "0.0.0.0:5060");
        assert_eq!(config.sip.server_id, "34020000002000000001");
        assert_eq!(config.sip.queue_capacity, 1024);
        assert_eq!(config.http.bind_addr, "0.0.0.0:8081");
        assert_eq!(config.streams.idle_timeout_secs, 300);
        assert_eq!(config.streams.sweep_interval_secs, 300);
        assert!(config.media.relay_endpoint.is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: GatewayConfig = toml::from_str(
            r#"
[sip]
domain = "4401000000"
"#,
        )
        .unwrap();

        assert_eq!(config.sip.domain, "4401000000");
        assert_eq!(config.sip.bind_addr, "0.0.0.0:5060");
        assert_eq!(config.media.timeout_ms, 3000);
    }

    #[test]
    fn test_to_toml_round_trip() {
        let text = GatewayConfig::default().to_toml().unwrap();
        let parsed: GatewayConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.sip.transaction_ttl_secs, 32);
    }
}
