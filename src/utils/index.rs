use crate::domain::Amount;

/// Render a base-unit amount with `decimals` fractional digits, trimming trailing zeros.
pub fn format_token_amount(amount: Amount, decimals: u32) -> String {
	let value = amount.value();
	let Some(scale) = 10u128.checked_pow(decimals) else {
		return value.to_string();
	};

	let whole = value / scale;
	let fraction = value % scale;
	if fraction == 0 {
		return whole.to_string();
	}

	let fraction = format!("{:0width$}", fraction, width = decimals as usize);
	format!("{}.{}", whole, fraction.trim_end_matches('0'))
}
