// Hyperliquid: WebSocket push feed plus REST /info queries
use std::net::IpAddr;
use std::sync::Arc;

use ahash::AHashMap;
use futures::stream::{self, SplitSink};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use super::hyperliquid_types::{PerpMeta, SpotMeta, WsBook, WsEnvelope, WsLevel, WsTrade};
use super::{Channel, Frame, FrameStream, RawTrade, Resolution, Session, SessionStatus, Transport, VenueQuery};
use crate::engine::types::{BookSnapshot, BookType, RawLevel, Side};
use crate::error::{FeedError, FeedResult};
use crate::market_data::instrument::Instrument;
use crate::market_data::normaliser::Normaliser;

pub const WS_URL: &str = "wss://api.hyperliquid.xyz/ws";
pub const INFO_URL: &str = "https://api.hyperliquid.xyz/info";

// Price decimals allowed on the venue: MAX_DECIMALS - szDecimals
const PERP_MAX_DECIMALS: u32 = 6;
const SPOT_MAX_DECIMALS: u32 = 8;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Decode one WebSocket text message into zero or more frames.
pub fn parse_message(text: &str) -> FeedResult<Vec<Frame>> {
    let envelope: WsEnvelope = serde_json::from_str(text)?;
    match envelope.channel.as_str() {
        "l2Book" => {
            let book: WsBook = serde_json::from_value(envelope.data)?;
            let snapshot = book_snapshot(&book)?;
            Ok(vec![Frame::Snapshot { snapshot, resolution: Resolution::Fine, last_update_id: None }])
        }
        "trades" => {
            let trades: Vec<WsTrade> = serde_json::from_value(envelope.data)?;
            trades.iter().map(|t| raw_trade(t).map(Frame::Trade)).collect()
        }
        "pong" => Ok(vec![Frame::Pong]),
        "error" => {
            let msg = envelope.data.as_str().map_or_else(|| envelope.data.to_string(), str::to_string);
            Ok(vec![Frame::Error(msg)])
        }
        "subscriptionResponse" => Ok(Vec::new()),
        other => {
            trace!(channel = other, "Ignoring channel");
            Ok(Vec::new())
        }
    }
}

fn parse_num(field: &str, value: &str) -> FeedResult<f64> {
    value
        .parse::<f64>()
        .map_err(|e| FeedError::Malformed(format!("{field} {value:?}: {e}")))
}

fn raw_levels(levels: &[WsLevel]) -> FeedResult<Vec<RawLevel>> {
    levels
        .iter()
        .map(|l| Ok(RawLevel::new(parse_num("px", &l.px)?, parse_num("sz", &l.sz)?)))
        .collect()
}

fn book_snapshot(book: &WsBook) -> FeedResult<BookSnapshot> {
    Ok(BookSnapshot::L2 { bids: raw_levels(&book.levels.0)?, asks: raw_levels(&book.levels.1)? })
}

fn raw_trade(trade: &WsTrade) -> FeedResult<RawTrade> {
    let side = match trade.side.as_str() {
        "B" => Side::BUY,
        "A" => Side::SELL,
        other => return Err(FeedError::Malformed(format!("trade side {other:?}"))),
    };
    Ok(RawTrade {
        id: trade.tid.to_string(),
        price: parse_num("px", &trade.px)?,
        quantity: parse_num("sz", &trade.sz)?,
        side,
        timestamp_ms: trade.time,
        aggregate_key: Some(trade.hash.clone()),
    })
}

pub struct HyperliquidTransport {
    pub ws_url: String,
}

impl HyperliquidTransport {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self { ws_url: ws_url.into() }
    }
}

impl Default for HyperliquidTransport {
    fn default() -> Self {
        Self::new(WS_URL)
    }
}

#[async_trait::async_trait]
impl Transport for HyperliquidTransport {
    async fn connect(&self, instrument: &Instrument) -> FeedResult<(Box<dyn Session>, FrameStream)> {
        let (ws, response) = tokio_tungstenite::connect_async(self.ws_url.as_str()).await?;
        debug!(url = %self.ws_url, coin = %instrument.venue_symbol, status = %response.status(), "WebSocket connected");
        let (sink, read) = ws.split();

        let status = Arc::new(Mutex::new(SessionStatus::Open));
        let reader_status = Arc::clone(&status);
        let frames = read
            .flat_map(move |msg| {
                let out: Vec<FeedResult<Frame>> = match msg {
                    Ok(Message::Text(text)) => match parse_message(&text) {
                        Ok(frames) => frames.into_iter().map(Ok).collect(),
                        Err(e) => vec![Err(e)],
                    },
                    Ok(Message::Close(close)) => {
                        *reader_status.lock() = SessionStatus::Closed;
                        vec![Err(FeedError::Disconnected(format!("closed by venue: {close:?}")))]
                    }
                    // control frames are answered by tungstenite
                    Ok(_) => Vec::new(),
                    Err(e) => {
                        *reader_status.lock() = SessionStatus::Error(e.to_string());
                        vec![Err(e.into())]
                    }
                };
                stream::iter(out)
            })
            .boxed();

        Ok((Box::new(HyperliquidSession { sink, status }), frames))
    }
}

struct HyperliquidSession {
    sink: WsSink,
    status: Arc<Mutex<SessionStatus>>,
}

impl HyperliquidSession {
    async fn send_json(&mut self, value: serde_json::Value) -> FeedResult<()> {
        let sent = self.sink.send(Message::Text(value.to_string())).await;
        if let Err(e) = &sent {
            *self.status.lock() = SessionStatus::Error(e.to_string());
        }
        Ok(sent?)
    }
}

#[async_trait::async_trait]
impl Session for HyperliquidSession {
    async fn subscribe(&mut self, instrument: &Instrument, channels: &[Channel]) -> FeedResult<()> {
        for channel in channels {
            let kind = match channel {
                Channel::OrderBook => "l2Book",
                Channel::Trades => "trades",
                // rounded books arrive on the same "l2Book" channel and cannot be told apart
                Channel::CoarseBook => {
                    warn!(coin = %instrument.venue_symbol, "Coarse depth is not offered separately, skipping");
                    continue;
                }
            };
            self.send_json(serde_json::json!({
                "method": "subscribe",
                "subscription": { "type": kind, "coin": instrument.venue_symbol }
            }))
            .await?;
        }
        Ok(())
    }

    async fn ping(&mut self) -> FeedResult<()> {
        self.send_json(serde_json::json!({ "method": "ping" })).await
    }

    fn status(&self) -> SessionStatus {
        self.status.lock().clone()
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.sink.close().await {
            debug!(error = %e, "WebSocket close failed");
        }
        *self.status.lock() = SessionStatus::Closed;
    }
}

/// REST egress for one worker. Catalog lookups teach every worker built by `workers` the
/// venue name of a symbol.
pub struct HyperliquidQuery {
    client: reqwest::Client,
    info_url: String,
    aliases: Arc<Mutex<AHashMap<String, String>>>,
}

impl HyperliquidQuery {
    pub fn new(info_url: impl Into<String>, local_address: Option<IpAddr>) -> FeedResult<Self> {
        Self::with_aliases(info_url.into(), local_address, Arc::default())
    }

    /// One query client per egress address, sharing symbol aliases.
    pub fn workers(info_url: &str, local_addresses: &[Option<IpAddr>]) -> FeedResult<Vec<Self>> {
        let aliases = Arc::new(Mutex::new(AHashMap::new()));
        local_addresses
            .iter()
            .map(|addr| Self::with_aliases(info_url.to_string(), *addr, Arc::clone(&aliases)))
            .collect()
    }

    fn with_aliases(
        info_url: String,
        local_address: Option<IpAddr>,
        aliases: Arc<Mutex<AHashMap<String, String>>>,
    ) -> FeedResult<Self> {
        let client = reqwest::Client::builder().local_address(local_address).gzip(true).build()?;
        Ok(Self { client, info_url, aliases })
    }

    async fn post<T: DeserializeOwned>(&self, body: serde_json::Value) -> FeedResult<T> {
        let res = self.client.post(&self.info_url).json(&body).send().await?;
        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(FeedError::Venue(format!("{status}: {text}")));
        }
        Ok(res.json::<T>().await?)
    }

    fn venue_symbol(&self, symbol: &str) -> String {
        self.aliases.lock().get(symbol).cloned().unwrap_or_else(|| symbol.to_string())
    }
}

#[async_trait::async_trait]
impl VenueQuery for HyperliquidQuery {
    async fn order_book(&self, symbol: &str, level: BookType) -> FeedResult<BookSnapshot> {
        if level != BookType::L2 {
            return Err(FeedError::Venue(format!("{level:?} books are not offered")));
        }
        let coin = self.venue_symbol(symbol);
        let book: WsBook = self.post(serde_json::json!({ "type": "l2Book", "coin": coin })).await?;
        book_snapshot(&book)
    }

    async fn instrument(&self, symbol: &str) -> FeedResult<Instrument> {
        let instrument = if symbol.contains('/') {
            let meta: SpotMeta = self.post(serde_json::json!({ "type": "spotMeta" })).await?;
            spot_instrument(&meta, symbol)
        } else {
            let meta: PerpMeta = self.post(serde_json::json!({ "type": "meta" })).await?;
            perp_instrument(&meta, symbol)
        }
        .ok_or_else(|| FeedError::UnknownInstrument { symbol: symbol.to_string() })?;

        self.aliases.lock().insert(instrument.symbol.clone(), instrument.venue_symbol.clone());
        Ok(instrument)
    }
}

fn perp_instrument(meta: &PerpMeta, symbol: &str) -> Option<Instrument> {
    let asset = meta.universe.iter().find(|a| a.name == symbol)?;
    let price_decimals = PERP_MAX_DECIMALS.saturating_sub(asset.sz_decimals);
    Some(Instrument::new(symbol, Normaliser::from_decimals(price_decimals, asset.sz_decimals), BookType::L2))
}

// Matches either the pair name itself or "BASE/QUOTE" built from token names
fn spot_instrument(meta: &SpotMeta, symbol: &str) -> Option<Instrument> {
    let token = |index: u32| meta.tokens.iter().find(|t| t.index == index);
    let pair = meta.universe.iter().find(|pair| {
        pair.name == symbol
            || matches!((token(pair.tokens.0), token(pair.tokens.1)),
                (Some(base), Some(quote)) if format!("{}/{}", base.name, quote.name) == symbol)
    })?;
    let base = token(pair.tokens.0)?;
    let price_decimals = SPOT_MAX_DECIMALS.saturating_sub(base.sz_decimals);
    Some(
        Instrument::new(symbol, Normaliser::from_decimals(price_decimals, base.sz_decimals), BookType::L2)
            .with_venue_symbol(pair.name.clone()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_l2_book() {
        let text = r#"{"channel":"l2Book","data":{"coin":"ETH","time":1700000000000,
            "levels":[[{"px":"2000.5","sz":"1.25","n":3}],[{"px":"2000.6","sz":"0.5","n":1}]]}}"#;
        let frames = parse_message(text).unwrap();
        assert_eq!(
            frames,
            vec![Frame::Snapshot {
                snapshot: BookSnapshot::L2 {
                    bids: vec![RawLevel::new(2000.5, 1.25)],
                    asks: vec![RawLevel::new(2000.6, 0.5)],
                },
                resolution: Resolution::Fine,
                last_update_id: None,
            }]
        );
    }

    #[test]
    fn test_parse_trades_share_aggregate_key() {
        let text = r#"{"channel":"trades","data":[
            {"coin":"ETH","side":"B","px":"2000.6","sz":"0.1","time":1,"hash":"0xabc","tid":11},
            {"coin":"ETH","side":"B","px":"2000.7","sz":"0.2","time":1,"hash":"0xabc","tid":12},
            {"coin":"ETH","side":"A","px":"2000.5","sz":"0.3","time":2,"hash":"0xdef","tid":13}]}"#;
        let frames = parse_message(text).unwrap();
        assert_eq!(frames.len(), 3);
        let Frame::Trade(first) = &frames[0] else { panic!("expected trade") };
        let Frame::Trade(last) = &frames[2] else { panic!("expected trade") };
        assert_eq!(first.side, Side::BUY);
        assert_eq!(first.aggregate_key.as_deref(), Some("0xabc"));
        assert_eq!(first.id, "11");
        assert_eq!(last.side, Side::SELL);
    }

    #[test]
    fn test_parse_control_channels() {
        assert_eq!(parse_message(r#"{"channel":"pong"}"#).unwrap(), vec![Frame::Pong]);
        assert!(parse_message(r#"{"channel":"subscriptionResponse","data":{"method":"subscribe"}}"#)
            .unwrap()
            .is_empty());
        assert_eq!(
            parse_message(r#"{"channel":"error","data":"Invalid subscription"}"#).unwrap(),
            vec![Frame::Error("Invalid subscription".into())]
        );
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(parse_message("not json"), Err(FeedError::Malformed(_))));
        let bad_px = r#"{"channel":"l2Book","data":{"coin":"ETH","time":1,"levels":[[{"px":"x","sz":"1","n":1}],[]]}}"#;
        assert!(matches!(parse_message(bad_px), Err(FeedError::Malformed(_))));
        let bad_side =
            r#"{"channel":"trades","data":[{"coin":"ETH","side":"X","px":"1","sz":"1","time":1,"hash":"h","tid":1}]}"#;
        assert!(matches!(parse_message(bad_side), Err(FeedError::Malformed(_))));
    }

    #[test]
    fn test_catalog_precision() {
        let perp: PerpMeta =
            serde_json::from_str(r#"{"universe":[{"name":"ETH","szDecimals":4,"maxLeverage":50}]}"#).unwrap();
        let eth = perp_instrument(&perp, "ETH").unwrap();
        assert_eq!(eth.normaliser, Normaliser::from_decimals(2, 4));
        assert!(perp_instrument(&perp, "DOGE").is_none());

        let spot: SpotMeta = serde_json::from_str(
            r#"{"tokens":[{"name":"USDC","szDecimals":8,"index":0},{"name":"HYPE","szDecimals":2,"index":150}],
                "universe":[{"name":"@107","tokens":[150,0],"index":107}]}"#,
        )
        .unwrap();
        let hype = spot_instrument(&spot, "HYPE/USDC").unwrap();
        assert_eq!(hype.venue_symbol, "@107");
        assert_eq!(hype.normaliser, Normaliser::from_decimals(6, 2));
    }
}
