/// USD per 1M tokens, (input, output). Exact match first, then longest
/// matching prefix; unknown models yield `None` (undefined cost).
const PRICING_TABLE: &[(&str, f64, f64)] = &[
    ("gpt-4o-mini", 0.15, 0.6),
    ("gpt-4o", 5.0, 15.0),
    ("gpt-4.1-mini", 0.3, 1.2),
    ("gpt-4.1-nano", 0.1, 0.4),
    ("gpt-4.1", 5.0, 15.0),
    ("gpt-5.1-codex-max", 1.25, 10.0),
    ("gpt-5.1-codex-mini", 0.25, 2.0),
    ("gpt-5.1-codex", 1.25, 10.0),
    ("gpt-5.2-codex", 1.75, 14.0),
    ("gpt-5.3-codex", 1.75, 14.0),
    ("gpt-5-codex", 1.25, 10.0),
    ("gpt-5", 5.0, 15.0),
    ("codex-mini-latest", 1.5, 6.0),
];

fn rate_for(model: &str) -> Option<(f64, f64)> {
    PRICING_TABLE
        .iter()
        .find(|(id, _, _)| *id == model)
        .or_else(|| PRICING_TABLE.iter().find(|(id, _, _)| model.starts_with(id)))
        .map(|(_, input, output)| (*input, *output))
}

/// Cost in USD for the given token counts, or `None` for an unpriced model.
pub fn cost_usd(model: Option<&str>, tokens_input: Option<i64>, tokens_output: Option<i64>) -> Option<f64> {
    let model = model?;
    let (input_rate, output_rate) = rate_for(model)?;
    let input_cost = tokens_input.unwrap_or(0) as f64 / 1_000_000.0 * input_rate;
    let output_cost = tokens_output.unwrap_or(0) as f64 / 1_000_000.0 * output_rate;
    Some(input_cost + output_cost)
}
