// src/command.rs
// Free-text chat input -> typed command.

use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use std::str::FromStr;

/// The closed set of intents a chat message can carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Balance,
    History,
    ClaimCoupon { code: String },
    /// `send <amount> to @<handle>`
    Send { amount: Decimal, recipient: String },
    /// `pay <charge id>`
    PayCharge { charge_id: String },
    Unrecognized,
}

// Amount is an integer or up to two decimal digits, optional leading currency
// symbol. Three decimal digits cannot satisfy `amount\s+to` and therefore
// never match, which keeps malformed amounts out without an explicit check.
static SEND_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^send\s+r?(\d+(?:\.\d{1,2})?)\s+to\s+(@\w+)").unwrap());

static PAY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^pay\s+([\w-]+)").unwrap());

static CLAIM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:claim|redeem)\s+([\w-]+)").unwrap());

impl Command {
    /// Parse a raw chat message. Never fails: anything that does not match a
    /// known pattern is `Unrecognized`.
    pub fn parse(text: &str) -> Command {
        let trimmed = text.trim();
        let lowered = trimmed.to_lowercase();

        match lowered.as_str() {
            "balance" | "bal" => return Command::Balance,
            "history" | "transactions" => return Command::History,
            _ => {}
        }

        if let Some(caps) = CLAIM_RE.captures(trimmed) {
            return Command::ClaimCoupon {
                code: caps[1].to_uppercase(),
            };
        }

        if let Some(caps) = SEND_RE.captures(trimmed) {
            if let Ok(amount) = Decimal::from_str(&caps[1]) {
                return Command::Send {
                    amount,
                    recipient: caps[2].to_string(),
                };
            }
        }

        if let Some(caps) = PAY_RE.captures(trimmed) {
            return Command::PayCharge {
                charge_id: caps[1].to_string(),
            };
        }

        Command::Unrecognized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn balance_keywords() {
        assert_eq!(Command::parse("balance"), Command::Balance);
        assert_eq!(Command::parse("  BAL "), Command::Balance);
        assert_eq!(Command::parse("history"), Command::History);
        assert_eq!(Command::parse("Transactions"), Command::History);
    }

    #[test]
    fn send_with_currency_symbol_and_decimals() {
        assert_eq!(
            Command::parse("send R50 to @lebo"),
            Command::Send {
                amount: dec("50"),
                recipient: "@lebo".into()
            }
        );
        assert_eq!(
            Command::parse("SEND 12.50 to @spaza_shop"),
            Command::Send {
                amount: dec("12.50"),
                recipient: "@spaza_shop".into()
            }
        );
    }

    #[test]
    fn send_with_three_decimal_digits_does_not_match() {
        assert_eq!(Command::parse("send R50.123 to @lebo"), Command::Unrecognized);
        assert_eq!(Command::parse("send 0.999 to @lebo"), Command::Unrecognized);
    }

    #[test]
    fn send_with_trailing_dot_does_not_match() {
        assert_eq!(Command::parse("send R50. to @lebo"), Command::Unrecognized);
    }

    #[test]
    fn pay_accepts_charge_tokens() {
        assert_eq!(
            Command::parse("pay charge_abc123"),
            Command::PayCharge {
                charge_id: "charge_abc123".into()
            }
        );
        assert_eq!(
            Command::parse("PAY 7f3e-44"),
            Command::PayCharge {
                charge_id: "7f3e-44".into()
            }
        );
    }

    #[test]
    fn claim_uppercases_the_code() {
        assert_eq!(
            Command::parse("claim spring10"),
            Command::ClaimCoupon {
                code: "SPRING10".into()
            }
        );
        assert_eq!(
            Command::parse("redeem Welcome-Back"),
            Command::ClaimCoupon {
                code: "WELCOME-BACK".into()
            }
        );
    }

    #[test]
    fn garbage_is_unrecognized_not_an_error() {
        for text in ["", "   ", "hello", "send to @lebo", "send R to @x", "pay"] {
            assert_eq!(Command::parse(text), Command::Unrecognized, "input: {:?}", text);
        }
    }
}
