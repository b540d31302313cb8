//! Decoder for raw exchange stream messages
//!
//! Classifies each message by its `e` discriminator field and produces a
//! typed record. A payload with no `e` field at all (as opposed to an
//! explicit null) is a snapshot-shaped book dump; its update ids are
//! synthesized from `lastUpdateId` and its event time from the injected
//! clock, since the exchange supplies neither for that shape.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::str::FromStr;
use tracing::warn;

use crate::clock::Clock;
use crate::error::{Result, SyncError};

/// Incremental depth update
#[derive(Debug, Clone, Deserialize)]
pub struct DepthUpdate {
    /// Event time (milliseconds)
    #[serde(rename = "E")]
    pub event_time: u64,

    /// Symbol
    #[serde(rename = "s")]
    pub symbol: String,

    /// First update ID covered by this event
    #[serde(rename = "U")]
    pub first_update_id: u64,

    /// Last update ID covered by this event (inclusive)
    #[serde(rename = "u")]
    pub last_update_id: u64,

    /// Bid level patches
    #[serde(rename = "b", deserialize_with = "deserialize_price_levels")]
    pub bids: Vec<PriceLevel>,

    /// Ask level patches
    #[serde(rename = "a", deserialize_with = "deserialize_price_levels")]
    pub asks: Vec<PriceLevel>,
}

/// Trade print
#[derive(Debug, Clone, Deserialize)]
pub struct TradeEvent {
    /// Event time
    #[serde(rename = "E")]
    pub event_time: u64,

    /// Symbol
    #[serde(rename = "s")]
    pub symbol: String,

    /// Trade ID
    #[serde(rename = "t")]
    pub trade_id: u64,

    /// Price
    #[serde(rename = "p", deserialize_with = "deserialize_decimal")]
    pub price: Decimal,

    /// Quantity
    #[serde(rename = "q", deserialize_with = "deserialize_decimal")]
    pub quantity: Decimal,

    /// Buyer order ID
    #[serde(rename = "b")]
    pub buyer_order_id: u64,

    /// Seller order ID
    #[serde(rename = "a")]
    pub seller_order_id: u64,

    /// Trade time
    #[serde(rename = "T")]
    pub trade_time: u64,

    /// Is buyer the maker
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,

    /// Is best price match
    #[serde(rename = "M", default)]
    pub is_best_match: bool,
}

/// Price level (price, quantity pair)
#[derive(Debug, Clone, PartialEq)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Full order book state at a point in time
#[derive(Debug, Clone, Deserialize)]
pub struct BookSnapshot {
    /// Last update ID already reflected in the snapshot
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,

    /// Bids
    #[serde(deserialize_with = "deserialize_price_levels")]
    pub bids: Vec<PriceLevel>,

    /// Asks
    #[serde(deserialize_with = "deserialize_price_levels")]
    pub asks: Vec<PriceLevel>,
}

/// Decoded stream message
#[derive(Debug, Clone)]
pub enum DecodedMessage {
    /// Incremental depth diff
    Diff(DepthUpdate),
    /// Book dump delivered in-band; ids and event time synthesized
    SnapshotShaped(DepthUpdate),
    /// Trade print
    Trade(TradeEvent),
    /// Unknown event type, dropped by the caller
    Unknown(String),
}

impl DecodedMessage {
    /// Decode a raw stream message
    ///
    /// Combined-stream wrappers (`{"stream": ..., "data": ...}`) are
    /// unwrapped transparently. Unknown event types are reported as
    /// [`DecodedMessage::Unknown`] so a stray message never halts the
    /// stream; malformed payloads fail with [`SyncError::Decode`].
    pub fn decode(raw: &str, clock: &dyn Clock) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)?;

        let (payload, stream_name) = match (value.get("stream"), value.get("data")) {
            (Some(Value::String(name)), Some(data)) => (data, Some(name.as_str())),
            _ => (&value, None),
        };

        match payload.get("e") {
            None => {
                let snapshot: BookSnapshot = serde_json::from_value(payload.clone())?;

                // Raw single-symbol streams carry no symbol for this shape;
                // combined streams name it in the stream prefix.
                let symbol = stream_name
                    .and_then(|name| name.split('@').next())
                    .map(|prefix| prefix.to_uppercase())
                    .unwrap_or_default();

                Ok(DecodedMessage::SnapshotShaped(DepthUpdate {
                    event_time: clock.now_millis(),
                    symbol,
                    first_update_id: snapshot.last_update_id,
                    last_update_id: snapshot.last_update_id,
                    bids: snapshot.bids,
                    asks: snapshot.asks,
                }))
            }
            Some(Value::String(event_type)) => match event_type.as_str() {
                "depthUpdate" => {
                    let update: DepthUpdate = serde_json::from_value(payload.clone())?;
                    if update.first_update_id > update.last_update_id {
                        return Err(SyncError::Decode(format!(
                            "inverted update id range: U={} > u={}",
                            update.first_update_id, update.last_update_id
                        )));
                    }
                    Ok(DecodedMessage::Diff(update))
                }
                "trade" => {
                    let trade: TradeEvent = serde_json::from_value(payload.clone())?;
                    Ok(DecodedMessage::Trade(trade))
                }
                other => {
                    warn!(event_type = %other, "unexpected event type, dropping message");
                    Ok(DecodedMessage::Unknown(other.to_string()))
                }
            },
            Some(_) => Err(SyncError::Decode(
                "event type field is not a string".to_string(),
            )),
        }
    }
}

/// Deserialize a Decimal from its wire string form
fn deserialize_decimal<'de, D>(deserializer: D) -> std::result::Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Decimal::from_str(&s).map_err(serde::de::Error::custom)
}

/// Deserialize price levels from an array of string pairs
fn deserialize_price_levels<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<PriceLevel>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Vec<String>> = Deserialize::deserialize(deserializer)?;
    raw.into_iter()
        .map(|pair| {
            if pair.len() != 2 {
                return Err(serde::de::Error::custom("invalid price level format"));
            }
            Ok(PriceLevel {
                price: Decimal::from_str(&pair[0]).map_err(serde::de::Error::custom)?,
                quantity: Decimal::from_str(&pair[1]).map_err(serde::de::Error::custom)?,
            })
        })
        .collect()
}
