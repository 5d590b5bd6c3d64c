// Source: https://api.hyperliquid.xyz/ws and POST https://api.hyperliquid.xyz/info
use serde::Deserialize;

// Outer envelope of every WebSocket push; `data` is decoded per channel
#[derive(Debug, Deserialize)]
pub struct WsEnvelope {
    pub channel: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

// Channel "l2Book", also the body of REST {"type":"l2Book"}
#[derive(Debug, Deserialize)]
pub struct WsBook {
    pub coin: String,
    pub levels: (Vec<WsLevel>, Vec<WsLevel>), // (bids, asks)
    pub time: u64,
}

#[derive(Debug, Deserialize)]
pub struct WsLevel {
    pub px: String, // price string, e.g. "1234.56"
    pub sz: String, // size string, e.g. "0.01"
    pub n: u32,     // number of orders at this level
}

// Channel "trades" carries a list of these
#[derive(Debug, Deserialize)]
pub struct WsTrade {
    pub coin: String,
    pub side: String, // "B" = buyer aggressed, "A" = seller aggressed
    pub px: String,
    pub sz: String,
    pub time: u64,
    pub hash: String, // shared by every fill of one taker order
    pub tid: u64,
}

// REST {"type":"meta"} (perpetuals)
#[derive(Debug, Deserialize)]
pub struct PerpMeta {
    pub universe: Vec<PerpAsset>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerpAsset {
    pub name: String,
    pub sz_decimals: u32,
}

// REST {"type":"spotMeta"}
#[derive(Debug, Deserialize)]
pub struct SpotMeta {
    pub tokens: Vec<SpotToken>,
    pub universe: Vec<SpotPair>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotToken {
    pub name: String,
    pub sz_decimals: u32,
    pub index: u32,
}

#[derive(Debug, Deserialize)]
pub struct SpotPair {
    pub name: String,      // e.g. "PURR/USDC", or "@107" for non-canonical pairs
    pub tokens: (u32, u32), // (base_token_index, quote_token_index)
    pub index: u32,
}
