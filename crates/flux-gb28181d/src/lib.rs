// flux-gb28181d: GB28181 信令网关
//
// - registry / handler: 设备注册、心跳、MESSAGE 处理
// - catalog / manscdp: 目录同步与 MANSCDP 消息体
// - stream / sweeper: 流会话注册表与空闲回收
// - api: 运维 HTTP 接口

pub mod api;
pub mod catalog;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod manscdp;
pub mod model;
pub mod registry;
pub mod store;
pub mod stream;
pub mod sweeper;

pub use error::{GatewayError, Result};
pub use gateway::Gateway;
pub use model::{DeviceMetadata, NvrDevice, SubDevice, SysInfo};
pub use registry::{AuthOutcome, DeviceRegistry};
pub use store::{MemoryStore, Store, StoreError};
pub use stream::{
    HttpRelay, MediaRelay, NullRelay, PlayRequest, StreamDescriptor, StreamKind, StreamRegistry,
};
