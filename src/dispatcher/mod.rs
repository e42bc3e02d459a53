//! Communication Dispatcher
//!
//! ## 概要
//! 検出レコードとヘルスログをコレクターへ送信する。
//! ネットワーク断・コレクター不在でも未送信データを失わない。
//!
//! ## モジュール構成
//! - `types`: 状態機械・送信統計・設定
//! - `envelope`: ワイヤーフォーマット (全チャネル共通)
//! - `backoff`: 再接続の指数バックオフ (ジッター付き)
//! - `channel`: WebSocket (primary) / HTTP (fallback)
//! - `connection`: 接続を単独所有するタスク
//! - `service`: Dispatcher 本体と送信ループ
//!
//! ## 配送保証
//! At-least-once。`message_id` はレコード単位で固定されるため、
//! 受信側で重複排除できる。

pub mod backoff;
pub mod channel;
pub mod connection;
pub mod envelope;
pub mod service;
pub mod types;

pub use channel::{ChannelConnector, CollectorChannel, NetworkConnector, TransportError};
pub use connection::SendError;
pub use envelope::{DataType, Envelope};
pub use service::Dispatcher;
pub use types::{
    CollectorEndpoint, ConnectionPhase, DispatcherConfig, DispatcherStatus, OfflinePolicy,
    Protocol, StreamStats,
};
