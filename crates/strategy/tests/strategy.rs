use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use common::{Bar, Error, SubscriptionKey};
use engine::mock::{kline_envelope, MockFetcher, MockStream};
use engine::Source;
use strategy::indicators::{Ema, Rsi, Sma, Wma};
use strategy::{signals, Consensus, Context, IndicatorBinding, NamedState, Strategy, StrategyBuilder};

const NOW: i64 = 1_683_700_000_000;
const BASE: i64 = 1_683_600_000_000;

fn falling(t: i64) -> f64 {
    400.0 - ((t - BASE) / 60_000) as f64 * 0.1
}

fn with_mocks(builder: StrategyBuilder, fetcher: MockFetcher) -> (Strategy, Arc<MockFetcher>, Arc<MockStream>) {
    let fetcher = Arc::new(fetcher);
    let stream = Arc::new(MockStream::new());
    let source = Arc::new(Source::new(fetcher.clone(), stream.clone()));
    (builder.source(source).build().unwrap(), fetcher, stream)
}

fn bar(timestamp: i64, close: f64) -> Bar {
    Bar {
        timestamp,
        open: close,
        high: close,
        low: close,
        close,
    }
}

fn sma(name: &str, interval: &str, period: usize) -> IndicatorBinding {
    IndicatorBinding::new(name, interval, Sma::new(period), signals::close_above(), period)
}

#[tokio::test]
async fn backtest_matches_expected_signal_when_both_averages_agree() {
    let builder = Strategy::builder("BNBUSD")
        .binding(sma("SMA20_1m", "1m", 20))
        .binding(IndicatorBinding::new("WMA20_1m", "1m", Wma::new(20), signals::close_above(), 20));
    let (strategy, _, _) = with_mocks(builder, MockFetcher::new(NOW).with_close(falling));

    let (matched, state) = strategy.backtest(1_683_685_980_000, Some(false)).await.unwrap();

    assert!(matched);
    assert_eq!(state.len(), 2);
    for name in ["SMA20_1m", "WMA20_1m"] {
        let s = &state[name];
        assert_eq!(s.interval, "1m");
        assert_eq!(s.signal, Some(false));
        let v = s.context["v"].as_f64().unwrap();
        let close = s.context["close"].as_f64().unwrap();
        assert!(close < v, "{name}: close {close} should be under {v}");
    }
    assert_eq!(state["SMA20_1m"].context["close"].as_f64(), Some(falling(1_683_685_980_000)));
}

#[tokio::test]
async fn backtest_reports_a_mismatch() {
    let builder = Strategy::builder("BNBUSD").binding(sma("SMA20_1m", "1m", 20));
    let (strategy, _, _) = with_mocks(builder, MockFetcher::new(NOW).with_close(falling));

    let (matched, _) = strategy.backtest(1_683_685_980_000, Some(true)).await.unwrap();
    assert!(!matched);
}

#[tokio::test]
async fn backtest_without_enough_history_is_indeterminate() {
    // Five bars of history can never warm up a 20-bar average.
    let builder = Strategy::builder("BNBUSD")
        .binding(IndicatorBinding::new("SMA20_1m", "1m", Sma::new(20), signals::close_above(), 5));
    let (strategy, _, _) = with_mocks(builder, MockFetcher::new(NOW));

    let err = strategy.backtest(1_683_685_980_000, Some(false)).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Indeterminate { ref symbol, timestamp: Some(1_683_685_980_000) } if symbol == "BNBUSD"
    ));
}

#[tokio::test]
async fn backtest_mid_hour_warms_up_every_interval() {
    // 1_683_685_980_000 is a minute boundary 13 minutes into the hour.
    let builder = Strategy::builder("BNBUSD")
        .binding(sma("SMA3_1m", "1m", 3))
        .binding(sma("SMA3_1h", "1h", 3));
    let (strategy, _, _) = with_mocks(builder, MockFetcher::new(NOW).with_close(|t| t as f64));

    let (matched, state) = strategy.backtest(1_683_685_980_000, Some(true)).await.unwrap();
    assert!(matched);
    assert_eq!(state["SMA3_1h"].signal, Some(true));
}

#[tokio::test]
async fn minimum_values_are_the_largest_per_interval() {
    let builder = Strategy::builder("BNBUSD")
        .binding(sma("SMA5_1m", "1m", 5))
        .binding(IndicatorBinding::new("RSI14_1h", "1h", Rsi::new(14), signals::value_below(30.0), 15))
        .binding(IndicatorBinding::new("EMA9_1m", "1m", Ema::new(9), signals::close_above(), 9));
    let (strategy, _, _) = with_mocks(builder, MockFetcher::new(NOW));

    assert_eq!(strategy.intervals(), ["1m", "1h"]);
    assert_eq!(strategy.minimum_values("1m"), Some(9));
    assert_eq!(strategy.minimum_values("1h"), Some(15));
    assert_eq!(strategy.minimum_values("1d"), None);
}

#[tokio::test]
async fn undecidable_until_every_binding_has_reported() {
    let builder = Strategy::builder("BNBUSD")
        .binding(sma("SMA2_1m", "1m", 2))
        .binding(sma("SMA2_5m", "5m", 2));
    let (strategy, _, _) = with_mocks(builder, MockFetcher::new(NOW));

    assert_eq!(strategy.next_value("1m", &bar(0, 1.0)), None);
    // The 1m binding is warm, but the 5m one has not been seen yet.
    assert_eq!(strategy.next_value("1m", &bar(60_000, 2.0)), None);
    assert_eq!(strategy.state().len(), 1);

    assert_eq!(strategy.next_value("5m", &bar(0, 1.0)), None);
    let state = strategy.next_value("5m", &bar(300_000, 3.0)).expect("decidable");
    assert_eq!(state["SMA2_1m"].signal, Some(true));
    assert_eq!(state["SMA2_5m"].signal, Some(true));
}

#[tokio::test]
async fn other_intervals_keep_their_state() {
    let builder = Strategy::builder("BNBUSD")
        .binding(sma("SMA1_1m", "1m", 1))
        .binding(IndicatorBinding::new("SMA2_5m", "5m", Sma::new(2), signals::close_below(), 2));
    let (strategy, _, _) = with_mocks(builder, MockFetcher::new(NOW));

    strategy.next_value("5m", &bar(0, 10.0));
    strategy.next_value("5m", &bar(300_000, 4.0));
    let first = strategy.next_value("1m", &bar(360_000, 5.0)).expect("decidable");
    let second = strategy.next_value("1m", &bar(420_000, 6.0)).expect("decidable");

    assert_eq!(first["SMA2_5m"], second["SMA2_5m"]);
    assert_ne!(first["SMA1_1m"], second["SMA1_1m"]);
}

#[tokio::test]
async fn a_null_signal_suspends_consensus() {
    let never = |_: f64, _: f64| (None::<bool>, Context::new());
    let builder = Strategy::builder("BNBUSD")
        .binding(sma("SMA1_1m", "1m", 1))
        .binding(IndicatorBinding::new("NEVER_1m", "1m", Sma::new(1), never, 1));
    let (strategy, _, _) = with_mocks(builder, MockFetcher::new(NOW));

    for i in 0..5 {
        assert_eq!(strategy.next_signal("1m", &bar(i * 60_000, 1.0)), None);
    }
}

#[tokio::test]
async fn disagreement_is_decidable_but_null() {
    let builder = Strategy::builder("BNBUSD")
        .binding(sma("ABOVE", "1m", 2))
        .binding(IndicatorBinding::new("BELOW", "1m", Sma::new(2), signals::close_below(), 2));
    let (strategy, _, _) = with_mocks(builder, MockFetcher::new(NOW));

    strategy.next_signal("1m", &bar(0, 1.0));
    let Consensus { signal, state } = strategy.next_signal("1m", &bar(60_000, 2.0)).expect("decidable");
    assert_eq!(signal, None);
    assert_eq!(state["ABOVE"].signal, Some(true));
    assert_eq!(state["BELOW"].signal, Some(false));
}

fn below_wins(states: &[NamedState<'_>]) -> Option<bool> {
    states.iter().find(|s| s.name == "BELOW").and_then(|s| s.signal())
}

#[tokio::test]
async fn custom_reducer_replaces_unanimity() {
    let builder = Strategy::builder("BNBUSD")
        .binding(sma("ABOVE", "1m", 2))
        .binding(IndicatorBinding::new("BELOW", "1m", Sma::new(2), signals::close_below(), 2))
        .reducer(below_wins);
    let (strategy, _, _) = with_mocks(builder, MockFetcher::new(NOW));

    strategy.next_signal("1m", &bar(0, 1.0));
    let consensus = strategy.next_signal("1m", &bar(60_000, 2.0)).expect("decidable");
    assert_eq!(consensus.signal, Some(false));
}

fn first_binding(states: &[NamedState<'_>]) -> Option<bool> {
    states.first().and_then(|s| s.signal())
}

#[tokio::test]
async fn reducer_sees_bindings_in_declaration_order() {
    let builder = Strategy::builder("BNBUSD")
        .binding(sma("Z_ABOVE", "1m", 2))
        .binding(IndicatorBinding::new("A_BELOW", "1m", Sma::new(2), signals::close_below(), 2))
        .reducer(first_binding);
    let (strategy, _, _) = with_mocks(builder, MockFetcher::new(NOW));

    strategy.next_signal("1m", &bar(0, 1.0));
    let consensus = strategy.next_signal("1m", &bar(60_000, 2.0)).expect("decidable");
    assert_eq!(consensus.signal, Some(true));
}

#[tokio::test]
async fn replay_walks_intervals_in_declaration_order() {
    let builder = Strategy::builder("BNBUSD")
        .binding(sma("SMA3_1h", "1h", 3))
        .binding(sma("SMA4_1m", "1m", 4));
    let (strategy, fetcher, _) = with_mocks(builder, MockFetcher::new(NOW).with_close(|t| t as f64));

    let consensus = strategy.get_signal(None).await.unwrap().expect("decidable");
    assert_eq!(consensus.signal, Some(true));

    let order: Vec<String> = fetcher.calls().into_iter().map(|c| c.interval).collect();
    // Latest-bar probe and one page per interval.
    assert_eq!(order, ["1h", "1h", "1m", "1m"]);
    let pages: Vec<usize> = fetcher.calls().iter().skip(1).step_by(2).map(|c| c.query.limit).collect();
    assert_eq!(pages, [3, 4]);
}

#[tokio::test]
async fn builder_rejects_bad_configuration() {
    let build = |builder: StrategyBuilder| {
        let fetcher = Arc::new(MockFetcher::new(NOW));
        builder
            .source(Arc::new(Source::new(fetcher, Arc::new(MockStream::new()))))
            .build()
            .err()
    };

    assert!(matches!(build(Strategy::builder("BNBUSD")), Some(Error::Config(_))));
    assert!(matches!(
        build(Strategy::builder("BNBUSD").binding(sma("A", "1m", 2)).binding(sma("A", "5m", 2))),
        Some(Error::Config(_))
    ));
    assert!(matches!(
        build(Strategy::builder("BNBUSD").binding(sma("A", "1y", 2))),
        Some(Error::Config(_))
    ));
    assert!(matches!(
        build(Strategy::builder("BNBUSD").binding(IndicatorBinding::new("A", "1m", Sma::new(2), signals::close_above(), 0))),
        Some(Error::Config(_))
    ));
}

// ─── Live ────────────────────────────────────────────────────────────────────

async fn recv(rx: &mut mpsc::UnboundedReceiver<Consensus>) -> Consensus {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timeout")
        .expect("channel closed")
}

#[tokio::test]
async fn run_warms_up_then_follows_live_bars() {
    let builder = Strategy::builder("BNBUSD").binding(
        IndicatorBinding::new("WMA20_1s", "1s", Wma::new(20), signals::close_above(), 20),
    );
    let (strategy, fetcher, stream) = with_mocks(builder, MockFetcher::new(NOW).with_close(falling));
    let key = SubscriptionKey::new("BNBUSD", "1s");
    let (tx, mut rx) = mpsc::unbounded_channel();

    strategy.run(move |c| { let _ = tx.send(c); }).await.unwrap();

    let warm = recv(&mut rx).await;
    assert_eq!(warm.signal, Some(false));

    stream.wait_for_connections(&key, 1).await;
    assert_eq!(strategy.source().connection_count(), 1);

    let next = fetcher.latest("1s").unwrap() + 1000;
    stream.push(&key, kline_envelope(next, 1_000.0, false)).await;
    stream.push(&key, kline_envelope(next, 1_000.0, true)).await;
    let live = recv(&mut rx).await;
    assert_eq!(live.signal, Some(true));
    assert_eq!(live.state["WMA20_1s"].context["close"].as_f64(), Some(1_000.0));

    strategy.stop();
    strategy.stop();
    assert_eq!(strategy.source().connection_count(), 0);
}

#[tokio::test]
async fn live_close_of_the_replayed_bar_is_not_fed_twice() {
    let builder = Strategy::builder("BNBUSD").binding(sma("SMA2_1s", "1s", 2));
    let (strategy, fetcher, stream) = with_mocks(builder, MockFetcher::new(NOW));
    let key = SubscriptionKey::new("BNBUSD", "1s");
    let (tx, mut rx) = mpsc::unbounded_channel();

    strategy.run(move |c| { let _ = tx.send(c); }).await.unwrap();
    assert_eq!(recv(&mut rx).await.signal, Some(false));
    stream.wait_for_connections(&key, 1).await;

    let latest = fetcher.latest("1s").unwrap();
    stream.push(&key, kline_envelope(latest, 500.0, true)).await;
    stream.push(&key, kline_envelope(latest + 1000, 500.0, true)).await;

    // Only the newer bar reaches the average: (100 + 500) / 2.
    let live = recv(&mut rx).await;
    assert_eq!(live.state["SMA2_1s"].context["v"].as_f64(), Some(300.0));
    assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());

    strategy.stop();
}

#[tokio::test]
async fn run_subscribes_once_per_interval() {
    let builder = Strategy::builder("BNBUSD")
        .binding(sma("SMA2_1m", "1m", 2))
        .binding(sma("SMA3_1m", "1m", 3))
        .binding(sma("SMA2_1h", "1h", 2));
    let (strategy, _, stream) = with_mocks(builder, MockFetcher::new(NOW));

    strategy.run(|_| {}).await.unwrap();

    let minute = SubscriptionKey::new("BNBUSD", "1m");
    let hour = SubscriptionKey::new("BNBUSD", "1h");
    stream.wait_for_connections(&minute, 1).await;
    stream.wait_for_connections(&hour, 1).await;
    assert_eq!(strategy.source().connection_count(), 2);
    assert_eq!(strategy.source().listener_count("BNBUSD", "1m"), 1);

    strategy.stop();
}
