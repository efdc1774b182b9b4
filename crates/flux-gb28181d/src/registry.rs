// GB28181 设备注册表
// REGISTER Digest 鉴权、活跃设备集合、心跳刷新

use crate::error::{GatewayError, Result};
use crate::model::{DeviceMetadata, NvrDevice};
use crate::store::{Store, StoreError};
use dashmap::DashMap;
use flux_sip::auth::{self, DigestParams};
use flux_sip::{Request, SipHeaders};
use std::sync::Arc;

/// REGISTER 鉴权结果
#[derive(Debug, Clone)]
pub enum AuthOutcome {
    /// 回复 401 并携带挑战
    Challenge,

    /// 鉴权通过
    Authorized(NvrDevice),

    /// 静默忽略（不回复）
    Ignore,
}

/// 从请求中解析设备信息：From 用户名 = 设备 ID，From 主机 = 设备域，网络字段取顶层 Via
pub fn device_from_request(req: &Request) -> Option<NvrDevice> {
    let Some(from) = req.from_header() else {
        tracing::warn!(target: "gb28181::sip", "From header missing or invalid");
        return None;
    };
    let Some(device_id) = from.uri.user.clone() else {
        tracing::warn!(target: "gb28181::sip", from = %from, "From header without user");
        return None;
    };
    let Some(via) = req.via_hop() else {
        tracing::info!(target: "gb28181::sip", %device_id, "Via header missing or invalid");
        return None;
    };

    Some(NvrDevice {
        device_id,
        region: from.uri.host.clone(),
        host: via.host.clone(),
        port: via.port,
        transport: via.transport.clone(),
        rport: via.rport().map(str::to_string),
        received: via.received().map(str::to_string),
        uri: from.uri.to_string(),
        source: req.source,
        address: Some(from),
        ..Default::default()
    })
}

pub struct DeviceRegistry {
    store: Arc<dyn Store>,

    /// 活跃设备（device_id -> 设备），后写覆盖
    active: DashMap<String, NvrDevice>,

    realm: Option<String>,

    /// 未知设备使用的默认密码
    default_password: Option<String>,
}

impl DeviceRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        realm: Option<String>,
        default_password: Option<String>,
    ) -> Self {
        Self {
            store,
            active: DashMap::new(),
            realm,
            default_password,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// 生成挑战的 (realm, nonce)；未配置 realm 时与 nonce 相同
    pub fn challenge(&self) -> (String, String) {
        let nonce = auth::generate_nonce();
        let realm = self.realm.clone().unwrap_or_else(|| nonce.clone());
        (realm, nonce)
    }

    /// 校验 REGISTER 请求
    pub async fn authenticate(&self, req: &Request) -> AuthOutcome {
        let Some(auth_header) = req.headers.get("Authorization") else {
            return AuthOutcome::Challenge;
        };

        let Some(from_request) = device_from_request(req) else {
            return AuthOutcome::Ignore;
        };
        let device_id = from_request.device_id.clone();

        let stored = match self.store.get_device(&device_id).await {
            Ok(device) => device,
            Err(StoreError::NotFound(_)) => match &self.default_password {
                Some(password) => {
                    let device = NvrDevice {
                        password: password.clone(),
                        registered: false,
                        ..from_request.clone()
                    };
                    if let Err(e) = self.store.upsert_device(&device).await {
                        tracing::warn!(target: "gb28181::sip", %device_id, error = %e, "failed to create device record");
                        return AuthOutcome::Ignore;
                    }
                    tracing::info!(target: "gb28181::sip", %device_id, "device record created with default password");
                    device
                }
                None => {
                    tracing::warn!(target: "gb28181::sip", %device_id, "unknown device, REGISTER ignored");
                    return AuthOutcome::Ignore;
                }
            },
            Err(e) => {
                tracing::warn!(target: "gb28181::sip", %device_id, error = %e, "device lookup failed, REGISTER ignored");
                return AuthOutcome::Ignore;
            }
        };

        // 未激活的设备以请求中的信息为准，仅保留密钥
        let mut device = if stored.registered {
            stored
        } else {
            NvrDevice {
                password: stored.password,
                registered: false,
                ..from_request.clone()
            }
        };
        device.refresh_address(&from_request);

        if !self.verify_digest(req, auth_header, &device) {
            tracing::warn!(target: "gb28181::sip", %device_id, "REGISTER digest auth failed");
            return AuthOutcome::Challenge;
        }

        device.active_at = chrono::Utc::now().timestamp();

        if !device.registered {
            device.registered = true;
            if let Err(e) = self.store.upsert_device(&device).await {
                tracing::warn!(target: "gb28181::sip", %device_id, error = %e, "failed to persist registration");
            }
            tracing::info!(target: "gb28181::sip", %device_id, "new device registered");
        }

        self.active.insert(device_id, device.clone());
        AuthOutcome::Authorized(device)
    }

    fn verify_digest(&self, req: &Request, header: &str, device: &NvrDevice) -> bool {
        let Some(params) = DigestParams::parse(header) else {
            return false;
        };
        let (Some(nonce), Some(response)) = (params.nonce(), params.response()) else {
            return false;
        };

        let realm = params.realm().unwrap_or_default();
        let uri = params.uri().unwrap_or(req.uri.as_str());
        let expected = auth::compute_response(
            &device.device_id,
            realm,
            &device.password,
            &req.method.to_string(),
            uri,
            nonce,
            params.qop_auth(),
        );

        expected.eq_ignore_ascii_case(response)
    }

    /// 注销（Expires: 0）
    pub fn unregister(&self, device_id: &str) -> Option<NvrDevice> {
        let removed = self.active.remove(device_id).map(|(_, d)| d);
        if removed.is_some() {
            tracing::info!(target: "gb28181::sip", %device_id, "device unregistered");
        }
        removed
    }

    /// 心跳：仅对活跃设备生效
    pub async fn keepalive(&self, from_request: &NvrDevice) -> Result<()> {
        let device_id = &from_request.device_id;
        let now = chrono::Utc::now().timestamp();

        {
            let Some(mut device) = self.active.get_mut(device_id) else {
                return Err(GatewayError::NotRegistered(device_id.clone()));
            };
            device.refresh_address(from_request);
            device.active_at = now;
        }

        self.store.touch_device(device_id, now).await?;
        Ok(())
    }

    /// DeviceInfo 响应：更新元数据
    pub async fn update_device_info(&self, device_id: &str, meta: &DeviceMetadata) -> Result<()> {
        self.store.update_device_info(device_id, meta).await?;
        if let Some(mut device) = self.active.get_mut(device_id) {
            device.manufacturer = meta.manufacturer.clone();
            device.model = meta.model.clone();
            device.device_type = meta.device_type.clone();
            device.firmware = meta.firmware.clone();
        }
        Ok(())
    }

    pub fn active(&self, device_id: &str) -> Option<NvrDevice> {
        self.active.get(device_id).map(|d| d.value().clone())
    }

    pub fn active_devices(&self) -> Vec<NvrDevice> {
        let mut devices: Vec<NvrDevice> = self.active.iter().map(|e| e.value().clone()).collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }
}
