// 设备持久化边界
// Store trait + 基于 DashMap 的内存实现

use crate::model::{DeviceMetadata, NvrDevice, SubDevice, SysInfo};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// 记录不存在（调用方据此决定插入或忽略）
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_device(&self, device_id: &str) -> StoreResult<NvrDevice>;

    /// 插入或整体替换设备记录
    async fn upsert_device(&self, device: &NvrDevice) -> StoreResult<()>;

    async fn update_device_info(&self, device_id: &str, meta: &DeviceMetadata) -> StoreResult<()>;

    async fn touch_device(&self, device_id: &str, active_at: i64) -> StoreResult<()>;

    /// 子设备按 (device_id, parent_id) 定位
    async fn get_sub_device(&self, device_id: &str, parent_id: &str) -> StoreResult<SubDevice>;

    async fn insert_sub_device(&self, device: &SubDevice) -> StoreResult<()>;

    async fn update_sub_device(&self, device: &SubDevice) -> StoreResult<()>;

    async fn list_sub_devices(&self, parent_id: &str) -> StoreResult<Vec<SubDevice>>;

    /// 子设备总数原子加一，返回新值
    async fn increment_sub_device_count(&self) -> StoreResult<u64>;

    async fn sys_info(&self) -> StoreResult<SysInfo>;
}

/// 内存存储
#[derive(Default)]
pub struct MemoryStore {
    devices: DashMap<String, NvrDevice>,
    sub_devices: DashMap<(String, String), SubDevice>,
    device_count: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device_len(&self) -> usize {
        self.devices.len()
    }

    pub fn sub_device_len(&self) -> usize {
        self.sub_devices.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_device(&self, device_id: &str) -> StoreResult<NvrDevice> {
        self.devices
            .get(device_id)
            .map(|d| d.value().clone())
            .ok_or_else(|| StoreError::NotFound(device_id.to_string()))
    }

    async fn upsert_device(&self, device: &NvrDevice) -> StoreResult<()> {
        self.devices.insert(device.device_id.clone(), device.clone());
        Ok(())
    }

    async fn update_device_info(&self, device_id: &str, meta: &DeviceMetadata) -> StoreResult<()> {
        let mut device = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| StoreError::NotFound(device_id.to_string()))?;
        device.manufacturer = meta.manufacturer.clone();
        device.model = meta.model.clone();
        device.device_type = meta.device_type.clone();
        device.firmware = meta.firmware.clone();
        Ok(())
    }

    async fn touch_device(&self, device_id: &str, active_at: i64) -> StoreResult<()> {
        let mut device = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| StoreError::NotFound(device_id.to_string()))?;
        device.active_at = active_at;
        Ok(())
    }

    async fn get_sub_device(&self, device_id: &str, parent_id: &str) -> StoreResult<SubDevice> {
        self.sub_devices
            .get(&(device_id.to_string(), parent_id.to_string()))
            .map(|d| d.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("{}@{}", device_id, parent_id)))
    }

    async fn insert_sub_device(&self, device: &SubDevice) -> StoreResult<()> {
        use dashmap::mapref::entry::Entry;

        let key = (device.device_id.clone(), device.parent_id.clone());
        match self.sub_devices.entry(key) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(format!(
                "{}@{}",
                device.device_id, device.parent_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(device.clone());
                Ok(())
            }
        }
    }

    async fn update_sub_device(&self, device: &SubDevice) -> StoreResult<()> {
        let key = (device.device_id.clone(), device.parent_id.clone());
        let mut slot = self
            .sub_devices
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(format!("{}@{}", key.0, key.1)))?;
        *slot = device.clone();
        Ok(())
    }

    async fn list_sub_devices(&self, parent_id: &str) -> StoreResult<Vec<SubDevice>> {
        let mut items: Vec<SubDevice> = self
            .sub_devices
            .iter()
            .filter(|e| e.value().parent_id == parent_id)
            .map(|e| e.value().clone())
            .collect();
        items.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(items)
    }

    async fn increment_sub_device_count(&self) -> StoreResult<u64> {
        Ok(self.device_count.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn sys_info(&self) -> StoreResult<SysInfo> {
        Ok(SysInfo {
            device_count: self.device_count.load(Ordering::SeqCst),
        })
    }
}
