#![no_main]

use std::sync::OnceLock;

use libfuzzer_sys::fuzz_target;
use sieve_classifier::Classifier;
use sieve_types::{LogLevel, LogRecord};

fn classifier() -> &'static Classifier {
    static CLASSIFIER: OnceLock<Classifier> = OnceLock::new();
    CLASSIFIER.get_or_init(|| Classifier::with_defaults().expect("default classifier"))
}

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    let mut fields = raw.split('\0');
    let mut record = LogRecord::new("fuzz", chrono::Utc::now(), LogLevel::Error);
    record.message = fields.next().map(str::to_string);
    record.logger_name = fields.next().map(str::to_string);
    record.exception_class = fields.next().map(str::to_string);
    if let (Some(name), Some(rule_type)) = (fields.next(), fields.next()) {
        record = record.with_rule(name, rule_type);
    }

    let classification = classifier().classify(&record);
    assert!(!classification.signature.is_empty());
    let fingerprint = classification.fingerprint();
    assert_eq!(fingerprint.len(), 64);
    assert_eq!(classifier().classify(&record).fingerprint(), fingerprint);
});
