/// Combine a micro confidence score with a macro multiplier into one bounded
/// integer: clamp(round(confidence * factor), 0, 100).
///
/// Total over all inputs: a missing or non-finite factor falls back to 1.0
/// (neutral), and a NaN product clamps to 0.
pub fn integrate_score(confidence_score: f64, macro_factor: Option<f64>) -> i64 {
    let factor = macro_factor.filter(|f| f.is_finite()).unwrap_or(1.0);
    let raw = (confidence_score * factor).round();
    if raw.is_nan() {
        return 0;
    }
    raw.clamp(0.0, 100.0) as i64
}
