// GB28181 设备模型
// NVR（注册设备）与其目录下的子设备（通道）

use flux_sip::NameAddr;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// 注册设备（NVR / IPC）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NvrDevice {
    pub device_id: String,

    pub name: String,

    /// 设备域（From 头部的 host）
    pub region: String,

    /// Via 地址
    pub host: String,

    pub port: Option<u16>,

    pub transport: String,

    /// Via rport
    pub rport: Option<String>,

    /// Via received
    pub received: Option<String>,

    pub uri: String,

    pub manufacturer: String,

    /// DVR / NVR / IPC
    pub device_type: String,

    pub firmware: String,

    pub model: String,

    /// 最后活跃时间（unix 秒）
    pub active_at: i64,

    /// 是否已完成首次注册
    pub registered: bool,

    /// Digest 共享密钥
    #[serde(skip_serializing)]
    pub password: String,

    /// 数据报来源地址（不持久化）
    #[serde(skip)]
    pub source: Option<SocketAddr>,

    /// From 地址（不持久化）
    #[serde(skip)]
    pub address: Option<NameAddr>,
}

impl NvrDevice {
    /// 用请求中的网络字段刷新地址
    pub fn refresh_address(&mut self, from: &NvrDevice) {
        self.host = from.host.clone();
        self.port = from.port;
        self.transport = from.transport.clone();
        self.rport = from.rport.clone();
        self.received = from.received.clone();
        self.source = from.source;
        self.address = from.address.clone();
    }
}

/// DeviceInfo 查询返回的设备元数据
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    pub manufacturer: String,
    pub model: String,
    pub device_type: String,
    pub firmware: String,
}

/// 子设备（摄像头通道）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubDevice {
    pub device_id: String,

    /// 所属注册设备 ID
    pub parent_id: String,

    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub owner: String,
    pub civil_code: String,
    pub address: String,
    pub parental: i32,
    pub safety_way: i32,
    pub register_way: i32,
    pub secrecy: i32,

    /// ON / OFF
    pub status: String,

    pub active_at: i64,
    pub uri: String,
}

/// 系统信息单例
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SysInfo {
    /// 子设备总数
    pub device_count: u64,
}
