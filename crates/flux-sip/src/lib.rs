// flux-sip: GB28181 信令事务引擎
//
// 流水线：
// - transport: UDP 收发
// - parser: 数据报 -> SIP 消息
// - server: 按方法分发请求、按事务键投递响应

pub mod auth;
pub mod error;
pub mod header;
pub mod message;
pub mod parser;
pub mod server;
pub mod transaction;
pub mod transport;

pub use error::{Result, SipError};
pub use header::{CSeq, Headers, NameAddr, Params, SipUri, ViaHop};
pub use message::{reason_phrase, Message, Method, Request, Response, SipHeaders};
pub use server::{RequestHandler, SipClient, SipServer, SipServerConfig};
pub use transaction::{transaction_key, Transaction, TransactionTable};
pub use transport::{Packet, Transport};
