//! Failure classifiers.
//!
//! A classifier is a pure predicate over [`ApiResponse`] metadata. Retry
//! loops take a classifier from the caller instead of hardcoding which
//! failures are worth another attempt.

use crate::api::ApiResponse;

/// Predicate over backend response metadata.
pub trait Classifier: Send + Sync {
    /// Returns true if the response belongs to this failure category.
    fn matches(&self, response: &ApiResponse) -> bool;
}

impl<F> Classifier for F
where
    F: Fn(&ApiResponse) -> bool + Send + Sync,
{
    fn matches(&self, response: &ApiResponse) -> bool {
        self(response)
    }
}

/// Status 404.
pub fn is_status_404(response: &ApiResponse) -> bool {
    response.status == 404
}

/// Status 400.
pub fn is_status_400(response: &ApiResponse) -> bool {
    response.status == 400
}

/// Status 409.
pub fn is_status_409(response: &ApiResponse) -> bool {
    response.status == 409
}

/// Status 429 (rate limited).
pub fn is_rate_limited(response: &ApiResponse) -> bool {
    response.status == 429
}

/// Gateway failures that did not reach the backend's business logic.
pub fn is_server_transient(response: &ApiResponse) -> bool {
    matches!(response.status, 502..=504)
}

/// The request never produced a response.
pub fn is_transport_failure(response: &ApiResponse) -> bool {
    response.status == 0
}

/// Failures every retry loop retries regardless of the caller's classifier.
pub fn is_transient(response: &ApiResponse) -> bool {
    is_rate_limited(response) || is_server_transient(response) || is_transport_failure(response)
}

/// Another writer changed the object between our read and our write.
///
/// Reported as 409, or as 400 with a version related error code by older
/// endpoints.
pub fn is_version_mismatch(response: &ApiResponse) -> bool {
    if response.status == 409 {
        return true;
    }
    response.status == 400
        && response
            .error_code()
            .is_some_and(|code| code.to_ascii_lowercase().contains("version"))
}

/// Never matches.
pub fn never(_response: &ApiResponse) -> bool {
    false
}

/// Matches any of the given statuses.
pub fn status_in(codes: &[u16]) -> impl Classifier {
    let codes = codes.to_vec();
    move |response: &ApiResponse| codes.contains(&response.status)
}

/// Matches when either classifier matches.
pub fn any_of<A, B>(a: A, b: B) -> impl Classifier
where
    A: Classifier,
    B: Classifier,
{
    move |response: &ApiResponse| a.matches(response) || b.matches(response)
}
