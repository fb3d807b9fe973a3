// src/websocket.rs
use crate::prices::PriceBook;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub symbol: String,
    pub ltp: f64,
    pub percent_change: Option<f64>,
}

fn field_f64(value: &Value, key: &str) -> Option<f64> {
    match value.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_tick(value: &Value) -> Option<Tick> {
    let raw_symbol = value
        .get("ts")
        .or_else(|| value.get("tk"))
        .and_then(Value::as_str)?;
    let symbol = raw_symbol
        .trim()
        .trim_end_matches("-EQ")
        .to_uppercase();
    let ltp = field_f64(value, "ltp")?;
    if symbol.is_empty() || ltp <= 0.0 {
        return None;
    }
    Some(Tick {
        symbol,
        ltp,
        percent_change: field_f64(value, "pc"),
    })
}

/// Decodes a feed frame holding one tick object or a list of them.
pub fn parse_ticks(frame: &str) -> Vec<Tick> {
    match serde_json::from_str::<Value>(frame) {
        Ok(Value::Array(items)) => items.iter().filter_map(parse_tick).collect(),
        Ok(value @ Value::Object(_)) => match value.get("data") {
            Some(Value::Array(items)) => items.iter().filter_map(parse_tick).collect(),
            _ => parse_tick(&value).into_iter().collect(),
        },
        _ => Vec::new(),
    }
}

fn subscription(symbols: &[String]) -> String {
    let scrips = symbols
        .iter()
        .map(|s| format!("nse_cm|{}-EQ", s))
        .collect::<Vec<_>>()
        .join("&");
    json!({ "type": "mws", "scrips": scrips, "channelnum": 1 }).to_string()
}

/// Streams broker ticks into `book` until `shutdown` is notified,
/// reconnecting after each disconnect.
pub async fn run_feed(url: String, symbols: Vec<String>, book: Arc<PriceBook>, shutdown: Arc<Notify>) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            result = feed_session(&url, &symbols, &book) => match result {
                Ok(()) => warn!("Quote feed closed by the broker"),
                Err(e) => error!("Quote feed error: {}", e),
            },
        }
        info!("Reconnecting to quote feed in {}s", RECONNECT_DELAY.as_secs());
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
    info!("Quote feed stopped");
}

async fn feed_session(
    url: &str,
    symbols: &[String],
    book: &PriceBook,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let (ws_stream, _) = connect_async(url).await?;
    info!("Connected to quote feed, subscribing to {} symbols", symbols.len());
    let (mut write, mut read) = ws_stream.split();
    write.send(Message::Text(subscription(symbols))).await?;

    while let Some(message) = read.next().await {
        match message? {
            Message::Text(frame) => {
                for tick in parse_ticks(&frame) {
                    debug!("Tick {} {}", tick.symbol, tick.ltp);
                    book.apply_tick(&tick.symbol, tick.ltp, tick.percent_change, Utc::now())
                        .await;
                }
            }
            Message::Ping(payload) => write.send(Message::Pong(payload)).await?,
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}

/// Pushes the current book and then every price update to one client.
pub async fn stream_quotes(socket: warp::ws::WebSocket, book: Arc<PriceBook>) {
    let (mut tx, mut rx) = socket.split();
    let mut updates = book.subscribe();

    let snapshot = book.snapshot().await;
    let hello = json!({ "type": "snapshot", "quotes": snapshot }).to_string();
    if tx.send(warp::ws::Message::text(hello)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(update) => {
                    let frame = match serde_json::to_string(&update) {
                        Ok(frame) => frame,
                        Err(e) => {
                            error!("Could not encode price update: {}", e);
                            continue;
                        }
                    };
                    if tx.send(warp::ws::Message::text(frame)).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Quote stream client lagged, {} updates dropped", missed);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            incoming = rx.next() => match incoming {
                Some(Ok(message)) if message.is_close() => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Quote stream client error: {}", e);
                    break;
                }
                None => break,
            },
        }
    }
    debug!("Quote stream client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_parse_from_lists_and_objects() {
        let ticks = parse_ticks(r#"[{"ts":"NIFTYBEES-EQ","ltp":"251.35","pc":"0.54"},{"tk":"ITBEES","ltp":41}]"#);
        assert_eq!(
            ticks,
            vec![
                Tick {
                    symbol: "NIFTYBEES".into(),
                    ltp: 251.35,
                    percent_change: Some(0.54)
                },
                Tick {
                    symbol: "ITBEES".into(),
                    ltp: 41.0,
                    percent_change: None
                },
            ]
        );
        assert_eq!(parse_ticks(r#"{"data":[{"ts":"BANKBEES","ltp":520}]}"#).len(), 1);
    }

    #[test]
    fn frames_without_prices_are_ignored() {
        assert!(parse_ticks(r#"{"type":"cn","stat":"Ok"}"#).is_empty());
        assert!(parse_ticks(r#"[{"ts":"GOLDSHARE","ltp":"0"}]"#).is_empty());
        assert!(parse_ticks("not json").is_empty());
    }

    #[test]
    fn subscription_lists_every_scrip() {
        let frame = subscription(&["NIFTYBEES".to_string(), "BANKBEES".to_string()]);
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "mws");
        assert_eq!(value["scrips"], "nse_cm|NIFTYBEES-EQ&nse_cm|BANKBEES-EQ");
    }

    #[tokio::test]
    async fn feed_stops_on_shutdown() {
        let shutdown = Arc::new(Notify::new());
        shutdown.notify_one();
        // Nothing listens on this port; the stored permit ends the loop first.
        run_feed(
            "ws://127.0.0.1:9/feed".to_string(),
            vec!["NIFTYBEES".to_string()],
            Arc::new(PriceBook::new(4)),
            shutdown,
        )
        .await;
    }
}
