use std::collections::HashMap;

use tracing::info;

use common::{Error, Result};

use crate::config::{IndicatorConfig, StrategyFileConfig};
use crate::indicators::{Ema, Rsi, Sma, Wma};
use crate::strategy::StrategyBuilder;
use crate::{signals, Indicator, IndicatorBinding, Strategy};

/// Start a strategy builder with one binding per configured indicator.
/// Unknown indicator or signal types are configuration errors.
pub fn builder_from_config(file_cfg: &StrategyFileConfig) -> Result<StrategyBuilder> {
    let bindings = file_cfg
        .indicators
        .iter()
        .map(|cfg| {
            let binding = build_binding(cfg)?;
            info!(
                name = %binding.name(),
                interval = %binding.interval(),
                minimum_values = binding.minimum_values(),
                "Registered binding"
            );
            Ok(binding)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Strategy::builder(&file_cfg.symbol).bindings(bindings))
}

// ─── Binding builders ────────────────────────────────────────────────────────

fn build_binding(cfg: &IndicatorConfig) -> Result<IndicatorBinding> {
    let period = param_usize(&cfg.params, "period", 14);
    let indicator: Box<dyn Indicator> = match cfg.indicator_type.as_str() {
        "sma" => Box::new(Sma::new(period.max(1))),
        "wma" => Box::new(Wma::new(period.max(1))),
        "ema" => Box::new(Ema::new(period.max(1))),
        "rsi" => Box::new(Rsi::new(period.max(2))),
        other => {
            return Err(Error::Config(format!(
                "binding '{}': unknown indicator type '{other}'",
                cfg.name
            )))
        }
    };
    let minimum_values = cfg.minimum_values.unwrap_or_else(|| indicator.warmup());

    let threshold = param_f64(&cfg.params, "threshold", 50.0);
    let binding = match cfg.signal.as_str() {
        "close_above" => IndicatorBinding::new(&cfg.name, &cfg.interval, indicator, signals::close_above(), minimum_values),
        "close_below" => IndicatorBinding::new(&cfg.name, &cfg.interval, indicator, signals::close_below(), minimum_values),
        "value_above" => IndicatorBinding::new(&cfg.name, &cfg.interval, indicator, signals::value_above(threshold), minimum_values),
        "value_below" => IndicatorBinding::new(&cfg.name, &cfg.interval, indicator, signals::value_below(threshold), minimum_values),
        other => {
            return Err(Error::Config(format!(
                "binding '{}': unknown signal '{other}'",
                cfg.name
            )))
        }
    };
    Ok(binding)
}

fn param_f64(params: &HashMap<String, toml::Value>, key: &str, default: f64) -> f64 {
    params
        .get(key)
        .and_then(|v| v.as_float().or_else(|| v.as_integer().map(|i| i as f64)))
        .unwrap_or(default)
}

fn param_usize(params: &HashMap<String, toml::Value>, key: &str, default: usize) -> usize {
    params
        .get(key)
        .and_then(|v| v.as_integer())
        .map(|v| v.max(0) as usize)
        .unwrap_or(default)
}
