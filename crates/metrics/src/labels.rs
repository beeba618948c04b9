use std::borrow::Cow;

/// Label set used by metrics that partition on request outcome.
pub const STATUS_LABEL: [&str; 1] = ["status"];

/// A single `key=value` metric label. Keys are static; values may be
/// computed at log time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricLabel {
    key: &'static str,
    value: Cow<'static, str>,
}

impl MetricLabel {
    pub const STATUS_ERROR: MetricLabel = MetricLabel {
        key: "status",
        value: Cow::Borrowed("error"),
    };
    pub const STATUS_SUCCESS: MetricLabel = MetricLabel {
        key: "status",
        value: Cow::Borrowed("success"),
    };

    pub fn new(key: &'static str, value: impl Into<Cow<'static, str>>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }

    pub fn status(is_ok: bool) -> Self {
        if is_ok {
            Self::STATUS_SUCCESS
        } else {
            Self::STATUS_ERROR
        }
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}
