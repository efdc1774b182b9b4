// GB28181 目录同步
// 把设备上报的目录项写入子设备表，新子设备计入全局计数

use crate::error::Result;
use crate::manscdp::CatalogItem;
use crate::store::{Store, StoreError};
use std::sync::Arc;

/// 设备上报状态到 ON/OFF 的归一化（OFFILE 是部分厂商的拼写）
pub fn normalize_status(status: &str) -> String {
    match status {
        "ON" | "ONLINE" => "ON".to_string(),
        "OFF" | "OFFILE" => "OFF".to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub inserted: usize,
    pub updated: usize,
}

pub struct CatalogSync {
    store: Arc<dyn Store>,

    /// SIP 域，用于生成子设备 URI
    domain: String,
}

impl CatalogSync {
    pub fn new(store: Arc<dyn Store>, domain: impl Into<String>) -> Self {
        Self {
            store,
            domain: domain.into(),
        }
    }

    /// 同步目录项；遇到非 NotFound 的存储错误立即中止
    pub async fn sync(&self, parent_id: &str, items: &[CatalogItem]) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let now = chrono::Utc::now().timestamp();

        for item in items {
            let mut sub = item.to_sub_device();
            sub.parent_id = parent_id.to_string();
            sub.active_at = now;
            sub.uri = format!("sip:{}@{}", item.device_id, self.domain);
            sub.status = normalize_status(&item.status);

            match self.store.get_sub_device(&item.device_id, parent_id).await {
                Ok(_) => {
                    self.store.update_sub_device(&sub).await?;
                    report.updated += 1;
                }
                Err(StoreError::NotFound(_)) => {
                    self.store.insert_sub_device(&sub).await?;
                    let total = self.store.increment_sub_device_count().await?;
                    report.inserted += 1;
                    tracing::debug!(
                        target: "gb28181d",
                        device_id = %item.device_id,
                        %parent_id,
                        total,
                        "sub-device added",
                    );
                }
                Err(e) => {
                    tracing::error!(
                        target: "gb28181d",
                        device_id = %item.device_id,
                        %parent_id,
                        error = %e,
                        "sub-device lookup failed, catalog sync aborted",
                    );
                    return Err(e.into());
                }
            }
        }

        tracing::info!(
            target: "gb28181d",
            %parent_id,
            inserted = report.inserted,
            updated = report.updated,
            "catalog synchronized",
        );
        Ok(report)
    }
}
