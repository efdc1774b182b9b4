// GB28181 MANSCDP 消息体
// Catalog / DeviceInfo / RecordInfo / Keepalive 的 XML 解析与查询生成

use crate::error::{GatewayError, Result};
use crate::model::{DeviceMetadata, SubDevice};
use quick_xml::de::from_str;
use rand::Rng;
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer};
use std::fmt::Display;
use std::str::FromStr;

pub const CONTENT_TYPE: &str = "Application/MANSCDP+xml";

/// 消息外层：只用于判断命令类型
#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct CommandEnvelope {
    pub cmd_type: String,

    #[serde(rename = "SN", default)]
    pub sn: Option<u32>,

    #[serde(rename = "DeviceID", default)]
    pub device_id: String,
}

/// 命令类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmdType {
    Catalog,
    Keepalive,
    RecordInfo,
    DeviceInfo,
    Unknown(String),
}

impl CommandEnvelope {
    pub fn kind(&self) -> CmdType {
        match self.cmd_type.trim() {
            "Catalog" => CmdType::Catalog,
            "Keepalive" => CmdType::Keepalive,
            "RecordInfo" => CmdType::RecordInfo,
            "DeviceInfo" => CmdType::DeviceInfo,
            other => CmdType::Unknown(other.to_string()),
        }
    }
}

/// 心跳通知
#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct KeepaliveNotify {
    #[serde(rename = "DeviceID", default)]
    pub device_id: String,

    #[serde(default)]
    pub status: String,
}

/// 目录响应
#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogResponse {
    #[serde(rename = "DeviceID")]
    pub device_id: String,

    #[serde(default, deserialize_with = "lenient_number")]
    pub sum_num: u32,

    #[serde(default)]
    pub device_list: Option<DeviceList>,
}

impl CatalogResponse {
    pub fn items(&self) -> &[CatalogItem] {
        self.device_list
            .as_ref()
            .map(|l| l.items.as_slice())
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct DeviceList {
    #[serde(rename = "@Num", default)]
    pub num: Option<u32>,

    #[serde(rename = "Item", default)]
    pub items: Vec<CatalogItem>,
}

/// 目录项（通道）
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogItem {
    #[serde(rename = "DeviceID")]
    pub device_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub manufacturer: String,

    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub owner: String,

    #[serde(default)]
    pub civil_code: String,

    #[serde(default)]
    pub address: String,

    #[serde(default, deserialize_with = "lenient_number")]
    pub parental: i32,

    #[serde(default, deserialize_with = "lenient_number")]
    pub safety_way: i32,

    #[serde(default, deserialize_with = "lenient_number")]
    pub register_way: i32,

    #[serde(default, deserialize_with = "lenient_number")]
    pub secrecy: i32,

    #[serde(default)]
    pub status: String,
}

impl CatalogItem {
    /// 转换为子设备记录（pdid / uri / 活跃时间由同步器填写）
    pub fn to_sub_device(&self) -> SubDevice {
        SubDevice {
            device_id: self.device_id.clone(),
            name: self.name.clone(),
            manufacturer: self.manufacturer.clone(),
            model: self.model.clone(),
            owner: self.owner.clone(),
            civil_code: self.civil_code.clone(),
            address: self.address.clone(),
            parental: self.parental,
            safety_way: self.safety_way,
            register_way: self.register_way,
            secrecy: self.secrecy,
            status: self.status.clone(),
            ..Default::default()
        }
    }
}

/// 设备信息响应
#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceInfoResponse {
    #[serde(rename = "DeviceID")]
    pub device_id: String,

    #[serde(default)]
    pub device_name: String,

    #[serde(default)]
    pub device_type: String,

    #[serde(default)]
    pub manufacturer: String,

    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub firmware: String,

    #[serde(default)]
    pub result: String,
}

impl DeviceInfoResponse {
    pub fn metadata(&self) -> DeviceMetadata {
        DeviceMetadata {
            manufacturer: self.manufacturer.clone(),
            model: self.model.clone(),
            device_type: self.device_type.clone(),
            firmware: self.firmware.clone(),
        }
    }
}

/// 录像查询响应
#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct RecordInfoResponse {
    #[serde(rename = "DeviceID")]
    pub device_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default, deserialize_with = "lenient_number")]
    pub sum_num: u32,

    #[serde(default)]
    pub record_list: Option<RecordList>,
}

impl RecordInfoResponse {
    pub fn items(&self) -> &[RecordItem] {
        self.record_list
            .as_ref()
            .map(|l| l.items.as_slice())
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct RecordList {
    #[serde(rename = "@Num", default)]
    pub num: Option<u32>,

    #[serde(rename = "Item", default)]
    pub items: Vec<RecordItem>,
}

/// 录像文件
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct RecordItem {
    #[serde(rename = "DeviceID", default)]
    pub device_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub file_path: String,

    #[serde(default)]
    pub address: String,

    #[serde(default)]
    pub start_time: String,

    #[serde(default)]
    pub end_time: String,

    #[serde(default, deserialize_with = "lenient_number")]
    pub secrecy: i32,

    #[serde(default)]
    pub r#type: String,
}

/// 数值元素：空元素（部分厂商输出 `<Parental></Parental>`）按 0 处理
fn lenient_number<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr + Default,
    T::Err: Display,
{
    let raw = String::deserialize(deserializer)?;
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(T::default());
    }
    raw.parse().map_err(D::Error::custom)
}

/// 解析 MANSCDP XML
pub fn decode<T: DeserializeOwned>(body: &str) -> Result<T> {
    from_str(body.trim()).map_err(|e| GatewayError::Xml(e.to_string()))
}

/// 随机命令序列号
pub fn next_sn() -> u32 {
    rand::thread_rng().gen_range(100_000..1_000_000)
}

fn query_xml(cmd_type: &str, sn: u32, device_id: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="GB2312"?>
<Query>
<CmdType>{}</CmdType>
<SN>{}</SN>
<DeviceID>{}</DeviceID>
</Query>"#,
        cmd_type, sn, device_id
    )
}

/// 生成目录查询 XML
pub fn catalog_query(sn: u32, device_id: &str) -> String {
    query_xml("Catalog", sn, device_id)
}

/// 生成设备信息查询 XML
pub fn device_info_query(sn: u32, device_id: &str) -> String {
    query_xml("DeviceInfo", sn, device_id)
}
