//! Callback interface of the protocol client and the table that routes
//! events to it.
use crate::error::{DispatchError, RecordError};
use crate::record::{Event, FieldKind, FieldValue, Method};
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Receiver of protocol callbacks, one method per [`Method`].
///
/// Every callback defaults to doing nothing, so implementors only write the
/// ones they care about.
#[allow(clippy::too_many_arguments)]
pub trait Listener: Send {
    fn current_time(&mut self, _time: i64) {}

    fn update_account_value(&mut self, _key: &str, _value: &str, _currency: &str, _account_name: &str) {}

    fn next_valid_id(&mut self, _order_id: i32) {}

    fn historical_data(
        &mut self,
        _req_id: i32,
        _date: &str,
        _open: f64,
        _high: f64,
        _low: f64,
        _close: f64,
        _volume: i32,
        _count: i32,
        _wap: f64,
        _has_gaps: bool,
    ) {
    }

    fn realtime_bar(
        &mut self,
        _req_id: i32,
        _time: i64,
        _open: f64,
        _high: f64,
        _low: f64,
        _close: f64,
        _volume: i64,
        _wap: f64,
        _count: i32,
    ) {
    }

    fn tick_generic(&mut self, _ticker_id: i32, _tick_type: i32, _value: f64) {}

    fn tick_price(&mut self, _ticker_id: i32, _field: i32, _price: f64, _can_auto_execute: i32) {}

    fn tick_size(&mut self, _ticker_id: i32, _field: i32, _size: i32) {}

    fn tick_string(&mut self, _ticker_id: i32, _tick_type: i32, _value: &str) {}

    fn update_mkt_depth(
        &mut self,
        _ticker_id: i32,
        _position: i32,
        _operation: i32,
        _side: i32,
        _price: f64,
        _size: i32,
    ) {
    }

    fn error(&mut self, _id: i32, _error_code: i32, _error_string: &str) {}
}

#[allow(clippy::too_many_arguments)]
impl<L: Listener + ?Sized> Listener for Box<L> {
    fn current_time(&mut self, time: i64) {
        (**self).current_time(time)
    }

    fn update_account_value(&mut self, key: &str, value: &str, currency: &str, account_name: &str) {
        (**self).update_account_value(key, value, currency, account_name)
    }

    fn next_valid_id(&mut self, order_id: i32) {
        (**self).next_valid_id(order_id)
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
        (**self).historical_data(req_id, date, open, high, low, close, volume, count, wap, has_gaps)
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
        (**self).realtime_bar(req_id, time, open, high, low, close, volume, wap, count)
    }

    fn tick_generic(&mut self, ticker_id: i32, tick_type: i32, value: f64) {
        (**self).tick_generic(ticker_id, tick_type, value)
    }

    fn tick_price(&mut self, ticker_id: i32, field: i32, price: f64, can_auto_execute: i32) {
        (**self).tick_price(ticker_id, field, price, can_auto_execute)
    }

    fn tick_size(&mut self, ticker_id: i32, field: i32, size: i32) {
        (**self).tick_size(ticker_id, field, size)
    }

    fn tick_string(&mut self, ticker_id: i32, tick_type: i32, value: &str) {
        (**self).tick_string(ticker_id, tick_type, value)
    }

    fn update_mkt_depth(&mut self, ticker_id: i32, position: i32, operation: i32, side: i32, price: f64, size: i32) {
        (**self).update_mkt_depth(ticker_id, position, operation, side, price, size)
    }

    fn error(&mut self, id: i32, error_code: i32, error_string: &str) {
        (**self).error(id, error_code, error_string)
    }
}

type Invoke<L> = fn(&mut L, &Event) -> Result<(), RecordError>;

/// Fixed mapping from [`Method`] to the listener callback that handles it.
pub struct DispatchTable<L: ?Sized> {
    handlers: [Invoke<L>; Method::COUNT],
}

impl<L: Listener + ?Sized> Default for DispatchTable<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: Listener + ?Sized> DispatchTable<L> {
    pub fn new() -> Self {
        DispatchTable { handlers: Method::ALL.map(handler_for::<L>) }
    }

    /// Decode `event` and invoke the matching callback.
    ///
    /// Arguments that do not fit the method schema, and panics raised by the
    /// listener, come back as [`DispatchError`].
    pub fn dispatch(&self, listener: &mut L, event: &Event) -> Result<(), DispatchError> {
        let method = event.method();
        let invoke = self.handlers[method.index()];
        match catch_unwind(AssertUnwindSafe(|| invoke(listener, event))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(DispatchError::Arguments { method, source }),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                Err(DispatchError::Listener { method, reason })
            }
        }
    }
}

fn handler_for<L: Listener + ?Sized>(method: Method) -> Invoke<L> {
    match method {
        Method::CurrentTime => current_time::<L>,
        Method::UpdateAccountValue => update_account_value::<L>,
        Method::NextValidId => next_valid_id::<L>,
        Method::HistoricalData => historical_data::<L>,
        Method::RealtimeBar => realtime_bar::<L>,
        Method::TickGeneric => tick_generic::<L>,
        Method::TickPrice => tick_price::<L>,
        Method::TickSize => tick_size::<L>,
        Method::TickString => tick_string::<L>,
        Method::UpdateMktDepth => update_mkt_depth::<L>,
        Method::Error => error::<L>,
    }
}

/// Positional reader over a validated event's fields.
struct Args<'a> {
    event: &'a Event,
    next: usize,
}

impl<'a> Args<'a> {
    fn new(event: &'a Event) -> Result<Self, RecordError> {
        event.validate()?;
        Ok(Args { event, next: 0 })
    }

    fn take(&mut self, kind: FieldKind) -> Result<&'a FieldValue, RecordError> {
        let index = self.next;
        self.next += 1;
        let mismatch = |got| RecordError::Kind { method: self.event.method(), index, expected: kind, got };
        match self.event.field(index) {
            Some(v) if v.kind() == kind => Ok(v),
            Some(v) => Err(mismatch(v.kind())),
            None => Err(RecordError::Arity {
                method: self.event.method(),
                expected: index + 1,
                got: self.event.fields().len(),
            }),
        }
    }

    fn i32(&mut self) -> Result<i32, RecordError> {
        Ok(self.take(FieldKind::I32)?.as_i32().unwrap_or_default())
    }

    fn i64(&mut self) -> Result<i64, RecordError> {
        Ok(self.take(FieldKind::I64)?.as_i64().unwrap_or_default())
    }

    fn f64(&mut self) -> Result<f64, RecordError> {
        Ok(self.take(FieldKind::F64)?.as_f64().unwrap_or_default())
    }

    fn str(&mut self) -> Result<&'a str, RecordError> {
        Ok(self.take(FieldKind::Str)?.as_str().unwrap_or_default())
    }

    fn flag(&mut self) -> Result<bool, RecordError> {
        Ok(self.i32()? != 0)
    }
}

fn current_time<L: Listener + ?Sized>(l: &mut L, e: &Event) -> Result<(), RecordError> {
    let mut a = Args::new(e)?;
    l.current_time(a.i64()?);
    Ok(())
}

fn update_account_value<L: Listener + ?Sized>(l: &mut L, e: &Event) -> Result<(), RecordError> {
    let mut a = Args::new(e)?;
    l.update_account_value(a.str()?, a.str()?, a.str()?, a.str()?);
    Ok(())
}

fn next_valid_id<L: Listener + ?Sized>(l: &mut L, e: &Event) -> Result<(), RecordError> {
    let mut a = Args::new(e)?;
    l.next_valid_id(a.i32()?);
    Ok(())
}

fn historical_data<L: Listener + ?Sized>(l: &mut L, e: &Event) -> Result<(), RecordError> {
    let mut a = Args::new(e)?;
    l.historical_data(
        a.i32()?,
        a.str()?,
        a.f64()?,
        a.f64()?,
        a.f64()?,
        a.f64()?,
        a.i32()?,
        a.i32()?,
        a.f64()?,
        a.flag()?,
    );
    Ok(())
}

fn realtime_bar<L: Listener + ?Sized>(l: &mut L, e: &Event) -> Result<(), RecordError> {
    let mut a = Args::new(e)?;
    l.realtime_bar(
        a.i32()?,
        a.i64()?,
        a.f64()?,
        a.f64()?,
        a.f64()?,
        a.f64()?,
        a.i64()?,
        a.f64()?,
        a.i32()?,
    );
    Ok(())
}

fn tick_generic<L: Listener + ?Sized>(l: &mut L, e: &Event) -> Result<(), RecordError> {
    let mut a = Args::new(e)?;
    l.tick_generic(a.i32()?, a.i32()?, a.f64()?);
    Ok(())
}

fn tick_price<L: Listener + ?Sized>(l: &mut L, e: &Event) -> Result<(), RecordError> {
    let mut a = Args::new(e)?;
    l.tick_price(a.i32()?, a.i32()?, a.f64()?, a.i32()?);
    Ok(())
}

fn tick_size<L: Listener + ?Sized>(l: &mut L, e: &Event) -> Result<(), RecordError> {
    let mut a = Args::new(e)?;
    l.tick_size(a.i32()?, a.i32()?, a.i32()?);
    Ok(())
}

fn tick_string<L: Listener + ?Sized>(l: &mut L, e: &Event) -> Result<(), RecordError> {
    let mut a = Args::new(e)?;
    l.tick_string(a.i32()?, a.i32()?, a.str()?);
    Ok(())
}

fn update_mkt_depth<L: Listener + ?Sized>(l: &mut L, e: &Event) -> Result<(), RecordError> {
    let mut a = Args::new(e)?;
    l.update_mkt_depth(a.i32()?, a.i32()?, a.i32()?, a.i32()?, a.f64()?, a.i32()?);
    Ok(())
}

fn error<L: Listener + ?Sized>(l: &mut L, e: &Event) -> Result<(), RecordError> {
    let mut a = Args::new(e)?;
    l.error(a.i32()?, a.i32()?, a.str()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Ticks {
        prices: Vec<(i32, i32, f64, i32)>,
        errors: Vec<(i32, i32, String)>,
    }

    impl Listener for Ticks {
        fn tick_price(&mut self, ticker_id: i32, field: i32, price: f64, can_auto_execute: i32) {
            self.prices.push((ticker_id, field, price, can_auto_execute));
        }

        fn error(&mut self, id: i32, error_code: i32, error_string: &str) {
            self.errors.push((id, error_code, error_string.to_string()));
        }

        fn tick_size(&mut self, _ticker_id: i32, _field: i32, _size: i32) {
            panic!("tick_size not expected");
        }
    }

    #[test]
    fn routes_each_method_to_its_callback() {
        let table = DispatchTable::<Ticks>::new();
        let mut l = Ticks::default();
        let tick = Event::new(Method::TickPrice, "t", 1, vec![100.into(), 1.into(), 20.25.into(), 0.into()]).unwrap();
        let err = Event::new(Method::Error, "t", 2, vec![1.into(), 200.into(), "no security".into()]).unwrap();
        let depth = Event::new(
            Method::UpdateMktDepth,
            "t",
            3,
            vec![100.into(), 0.into(), 1.into(), 1.into(), 20.5.into(), 300.into()],
        )
        .unwrap();
        table.dispatch(&mut l, &tick).unwrap();
        table.dispatch(&mut l, &err).unwrap();
        // Unhandled callbacks fall through to the default no-op.
        table.dispatch(&mut l, &depth).unwrap();
        assert_eq!(l.prices, vec![(100, 1, 20.25, 0)]);
        assert_eq!(l.errors, vec![(1, 200, "no security".to_string())]);
    }

    #[test]
    fn listener_panic_becomes_dispatch_error() {
        let table = DispatchTable::<Ticks>::new();
        let mut l = Ticks::default();
        let ev = Event::new(Method::TickSize, "t", 1, vec![1.into(), 2.into(), 3.into()]).unwrap();
        let err = table.dispatch(&mut l, &ev).unwrap_err();
        assert!(matches!(err, DispatchError::Listener { method: Method::TickSize, .. }));
    }

    #[test]
    fn decoded_events_with_wrong_fields_are_rejected() {
        // Bypass the validating constructor the way a foreign decoder could.
        let bytes = bincode::serialize(&(Method::TickSize, "t", 1i64, vec![FieldValue::Str("x".into())])).unwrap();
        let ev: Event = bincode::deserialize(&bytes).unwrap();
        let table = DispatchTable::<Box<dyn Listener>>::new();
        let mut l: Box<dyn Listener> = Box::new(Ticks::default());
        let err = table.dispatch(&mut l, &ev).unwrap_err();
        assert!(matches!(err, DispatchError::Arguments { method: Method::TickSize, .. }));
    }
}
