// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Shared helpers for date/time handling and deadlines.

use crate::error::{AppError, Result};
use chrono::{DateTime, Datelike, Utc};
use std::future::Future;
use std::time::Duration;

/// True when both instants fall in the same UTC calendar month.
pub fn same_calendar_month(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.year() == b.year() && a.month() == b.month()
}

/// Run `fut` with a deadline. An elapsed deadline is a retryable dependency failure.
pub async fn within<T, F>(limit: Duration, operation: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                operation,
                timeout_ms = limit.as_millis() as u64,
                "Dependency call timed out"
            );
            Err(AppError::Transient(format!(
                "{operation} timed out after {}ms",
                limit.as_millis()
            )))
        }
    }
}
