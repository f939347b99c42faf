//! crates/fee_portal_core/src/payment.rs
//!
//! Formatting and validation for the simulated card payment form.
//! Everything here is pure; nothing contacts a payment processor.

use chrono::{DateTime, Utc};
use rand::Rng;
use regex::Regex;
use std::sync::OnceLock;

/// The payment method recorded for every simulated card payment.
pub const CARD_PAYMENT_METHOD: &str = "Credit Card";

const TOKEN_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const TOKEN_SUFFIX_LEN: usize = 9;

fn digits_only(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn card_run() -> &'static Regex {
    static CARD_RUN: OnceLock<Regex> = OnceLock::new();
    CARD_RUN.get_or_init(|| Regex::new(r"\d{4,16}").expect("card run pattern is valid"))
}

/// Groups the first run of up to 16 digits into blocks of four.
///
/// Input with fewer than four digits is returned as bare digits.
pub fn format_card_number(value: &str) -> String {
    let digits = digits_only(value);
    let Some(run) = card_run().find(&digits) else {
        return digits;
    };
    run.as_str()
        .as_bytes()
        .chunks(4)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// `MMYY` becomes `MM/YY`; a slash appears as soon as two digits are present.
pub fn format_expiry(value: &str) -> String {
    let digits = digits_only(value);
    if digits.len() < 2 {
        return digits;
    }
    let end = digits.len().min(4);
    format!("{}/{}", &digits[..2], &digits[2..end])
}

pub fn format_cvv(value: &str) -> String {
    digits_only(value).chars().take(3).collect()
}

/// The last four digits of a card number, if it has at least four.
pub fn card_last_four(card_number: &str) -> Option<String> {
    let digits = digits_only(card_number);
    (digits.len() >= 4).then(|| digits[digits.len() - 4..].to_string())
}

/// A human-readable transaction token: `TXN_<epoch millis>_<9 base-36 chars>`.
///
/// Not guaranteed unique; the database row id is the real identity.
pub fn transaction_token(now: DateTime<Utc>) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..TOKEN_SUFFIX_LEN)
        .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
        .collect();
    format!("TXN_{}_{}", now.timestamp_millis(), suffix)
}

//=========================================================================================
// Validation
//=========================================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaymentValidationError {
    #[error("Please enter a valid 16-digit card number")]
    CardNumber,
    #[error("Please enter a valid expiry date (MM/YY)")]
    Expiry,
    #[error("Please enter a valid 3-digit CVV")]
    Cvv,
    #[error("Please enter the cardholder name")]
    CardholderName,
    #[error("Please enter a valid payment amount")]
    Amount,
}

/// The card form as submitted.
#[derive(Debug, Clone, Default)]
pub struct PaymentForm {
    pub card_number: String,
    pub expiry: String,
    pub cvv: String,
    pub cardholder_name: String,
    /// Smallest currency unit.
    pub amount: i64,
}

impl PaymentForm {
    /// Runs each field through its formatter, as the form does on every keystroke.
    pub fn normalized(&self) -> Self {
        Self {
            card_number: format_card_number(&self.card_number),
            expiry: format_expiry(&self.expiry),
            cvv: format_cvv(&self.cvv),
            cardholder_name: self.cardholder_name.clone(),
            amount: self.amount,
        }
    }

    /// Checks the rules in order and reports the first one that fails.
    pub fn validate(&self) -> Result<(), PaymentValidationError> {
        if digits_only(&self.card_number).len() < 16 {
            return Err(PaymentValidationError::CardNumber);
        }
        if self.expiry.len() < 5 {
            return Err(PaymentValidationError::Expiry);
        }
        if self.cvv.len() < 3 {
            return Err(PaymentValidationError::Cvv);
        }
        if self.cardholder_name.trim().is_empty() {
            return Err(PaymentValidationError::CardholderName);
        }
        if self.amount <= 0 {
            return Err(PaymentValidationError::Amount);
        }
        Ok(())
    }
}
