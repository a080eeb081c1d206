//! A [`Listener`] that turns callbacks back into [`Event`]s.
use crate::listener::Listener;
use crate::record::{Event, FieldValue, Method};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or_default()
}

/// Rebuilds every callback it receives as an [`Event`] stamped with the
/// wall clock and sends it down a channel.
///
/// Clones share the channel and the drop counter.
#[derive(Clone)]
pub struct EventCapture {
    source: Arc<str>,
    tx: Sender<Event>,
    dropped: Arc<AtomicU64>,
}

impl EventCapture {
    pub fn new(source: &str, tx: Sender<Event>) -> Self {
        EventCapture { source: Arc::from(source), tx, dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// A capture and the receiving end of its channel.
    pub fn channel(source: &str) -> (Self, Receiver<Event>) {
        let (tx, rx) = unbounded();
        (Self::new(source, tx), rx)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Forward an already built event. False once the receiver is gone.
    pub fn send(&self, event: Event) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Callbacks lost because the receiver was gone.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn capture(&self, method: Method, fields: Vec<FieldValue>) {
        let event = Event::trusted(method, &self.source, now_micros(), fields);
        if self.tx.send(event).is_err() && self.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
            warn!(source = %self.source, %method, "capture receiver gone, dropping callbacks");
        }
    }
}

#[allow(clippy::too_many_arguments)]
impl Listener for EventCapture {
    fn current_time(&mut self, time: i64) {
        self.capture(Method::CurrentTime, vec![time.into()]);
    }

    fn update_account_value(&mut self, key: &str, value: &str, currency: &str, account_name: &str) {
        self.capture(
            Method::UpdateAccountValue,
            vec![key.into(), value.into(), currency.into(), account_name.into()],
        );
    }

    fn next_valid_id(&mut self, order_id: i32) {
        self.capture(Method::NextValidId, vec![order_id.into()]);
    }

    fn historical_data(
        &mut self,
        req_id: i32,
        date: &str,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: i32,
        count: i32,
        wap: f64,
        has_gaps: bool,
    ) {
        self.capture(
            Method::HistoricalData,
            vec![
                req_id.into(),
                date.into(),
                open.into(),
                high.into(),
                low.into(),
                close.into(),
                volume.into(),
                count.into(),
                wap.into(),
                has_gaps.into(),
            ],
        );
    }

    fn realtime_bar(
        &mut self,
        req_id: i32,
        time: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: i64,
        wap: f64,
        count: i32,
    ) {
        self.capture(
            Method::RealtimeBar,
            vec![
                req_id.into(),
                time.into(),
                open.into(),
                high.into(),
                low.into(),
                close.into(),
                volume.into(),
                wap.into(),
                count.into(),
            ],
        );
    }

    fn tick_generic(&mut self, ticker_id: i32, tick_type: i32, value: f64) {
        self.capture(Method::TickGeneric, vec![ticker_id.into(), tick_type.into(), value.into()]);
    }

    fn tick_price(&mut self, ticker_id: i32, field: i32, price: f64, can_auto_execute: i32) {
        self.capture(
            Method::TickPrice,
            vec![ticker_id.into(), field.into(), price.into(), can_auto_execute.into()],
        );
    }

    fn tick_size(&mut self, ticker_id: i32, field: i32, size: i32) {
        self.capture(Method::TickSize, vec![ticker_id.into(), field.into(), size.into()]);
    }

    fn tick_string(&mut self, ticker_id: i32, tick_type: i32, value: &str) {
        self.capture(Method::TickString, vec![ticker_id.into(), tick_type.into(), value.into()]);
    }

    fn update_mkt_depth(&mut self, ticker_id: i32, position: i32, operation: i32, side: i32, price: f64, size: i32) {
        self.capture(
            Method::UpdateMktDepth,
            vec![
                ticker_id.into(),
                position.into(),
                operation.into(),
                side.into(),
                price.into(),
                size.into(),
            ],
        );
    }

    fn error(&mut self, id: i32, error_code: i32, error_string: &str) {
        self.capture(Method::Error, vec![id.into(), error_code.into(), error_string.into()]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::DispatchTable;

    #[test]
    fn dispatch_then_capture_preserves_fields() {
        let (mut capture, rx) = EventCapture::channel("cap");
        let table = DispatchTable::<EventCapture>::new();
        let sent = vec![
            Event::new(Method::TickString, "feed", 5, vec![1.into(), 45.into(), "1700000000".into()]).unwrap(),
            Event::new(
                Method::HistoricalData,
                "feed",
                6,
                vec![
                    7.into(),
                    "20240102".into(),
                    1.0.into(),
                    2.0.into(),
                    0.5.into(),
                    1.5.into(),
                    100.into(),
                    10.into(),
                    1.25.into(),
                    true.into(),
                ],
            )
            .unwrap(),
        ];
        for e in &sent {
            table.dispatch(&mut capture, e).unwrap();
        }
        let got: Vec<Event> = rx.try_iter().collect();
        assert_eq!(got.len(), 2);
        for (s, g) in sent.iter().zip(&got) {
            assert_eq!(g.method(), s.method());
            assert_eq!(g.fields(), s.fields());
            assert_eq!(g.source(), "cap");
        }
    }

    #[test]
    fn drops_are_counted_once_receiver_is_gone() {
        let (mut capture, rx) = EventCapture::channel("cap");
        drop(rx);
        capture.next_valid_id(1);
        capture.next_valid_id(2);
        assert_eq!(capture.dropped(), 2);
    }
}
