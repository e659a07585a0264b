//! Type definitions for Hyperliquid API requests and responses.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;

/// Request type for Hyperliquid info endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum InfoRequest {
    /// Mid prices for every coin of a dex.
    #[serde(rename = "allMids")]
    AllMids {
        #[serde(skip_serializing_if = "Option::is_none")]
        dex: Option<String>,
    },

    /// Margin summary and open positions of a user.
    #[serde(rename = "clearinghouseState")]
    ClearinghouseState {
        user: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        dex: Option<String>,
    },
}

/// Response from clearinghouseState.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearinghouseState {
    #[serde(default)]
    pub asset_positions: Vec<AssetPosition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssetPosition {
    pub position: PositionData,
}

/// A single open position.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionData {
    /// Coin name, prefixed with `"{dex}:"` on builder-deployed dexes
    pub coin: String,
    /// Signed size: positive long, negative short
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub szi: Decimal,
    pub leverage: LeverageInfo,
    #[serde(default, deserialize_with = "deserialize_decimal_str_option_null")]
    pub entry_px: Option<Decimal>,
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub position_value: Decimal,
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub unrealized_pnl: Decimal,
    /// Null when the position cannot be liquidated
    #[serde(default, deserialize_with = "deserialize_decimal_str_option_null")]
    pub liquidation_px: Option<Decimal>,
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub margin_used: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeverageInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: u32,
}

/// Deserialize a decimal from a string.
fn deserialize_decimal_str<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Decimal::from_str(&s).map_err(serde::de::Error::custom)
}

/// Deserialize an optional decimal from a string that may be null.
fn deserialize_decimal_str_option_null<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt: Option<String> = Option::deserialize(deserializer)?;
    match opt {
        Some(s) => Decimal::from_str(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_deserialize_clearinghouse_state() {
        let json = r#"{
            "assetPositions": [{
                "type": "oneWay",
                "position": {
                    "coin": "ETH",
                    "szi": "-12.5",
                    "leverage": {"type": "isolated", "value": 10, "rawUsd": "4000.0"},
                    "entryPx": "3200.0",
                    "positionValue": "40000.0",
                    "unrealizedPnl": "-125.5",
                    "returnOnEquity": "-0.03",
                    "liquidationPx": "3450.2",
                    "marginUsed": "4000.0",
                    "maxLeverage": 25,
                    "cumFunding": {"allTime": "1.0", "sinceOpen": "0.5", "sinceChange": "0.5"}
                }
            }],
            "withdrawable": "100.0"
        }"#;

        let state: ClearinghouseState = serde_json::from_str(json).unwrap();
        let pos = &state.asset_positions[0].position;
        assert_eq!(pos.szi, dec!(-12.5));
        assert_eq!(pos.leverage.kind, "isolated");
        assert_eq!(pos.liquidation_px, Some(dec!(3450.2)));
    }

    #[test]
    fn test_null_liquidation_price() {
        let json = r#"{
            "coin": "BTC",
            "szi": "0.5",
            "leverage": {"type": "cross", "value": 2},
            "entryPx": "60000.0",
            "positionValue": "30000.0",
            "unrealizedPnl": "0.0",
            "liquidationPx": null,
            "marginUsed": "15000.0"
        }"#;

        let pos: PositionData = serde_json::from_str(json).unwrap();
        assert_eq!(pos.liquidation_px, None);
    }

    #[test]
    fn test_request_serialization() {
        let main = serde_json::to_value(InfoRequest::AllMids { dex: None }).unwrap();
        assert_eq!(main, serde_json::json!({"type": "allMids"}));

        let user = serde_json::to_value(InfoRequest::ClearinghouseState {
            user: "0xabc".to_string(),
            dex: Some("xyz".to_string()),
        })
        .unwrap();
        assert_eq!(
            user,
            serde_json::json!({"type": "clearinghouseState", "user": "0xabc", "dex": "xyz"})
        );
    }
}
