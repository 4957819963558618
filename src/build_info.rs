//! Build identification for outbound requests.

/// Product name used in the `User-Agent` header.
pub const PRODUCT: &str = "zipstreamer";

/// Short build revision: the first 8 characters of `ZIPSTREAMER_REVISION`
/// as set at compile time, or `dev`.
pub fn revision() -> &'static str {
    short_revision(option_env!("ZIPSTREAMER_REVISION"))
}

fn short_revision(rev: Option<&'static str>) -> &'static str {
    match rev.map(str::trim) {
        Some(rev) if !rev.is_empty() => rev.get(..8).unwrap_or(rev),
        _ => "dev",
    }
}

/// `User-Agent` value sent with every generic fetch.
pub fn user_agent() -> String {
    format!("{PRODUCT}/{}", revision())
}
