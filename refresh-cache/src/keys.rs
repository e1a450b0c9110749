//! Cache key names, `<component>:<resource>[:<param>]`.

pub const HEALTH_REPORT: &str = "health:report";
pub const HEALTH_REPORT_VERBOSE: &str = "health:report:verbose";
pub const METRICS_TOTALS: &str = "metrics:totals";

pub fn health_report(verbose: bool) -> &'static str {
    if verbose {
        HEALTH_REPORT_VERBOSE
    } else {
        HEALTH_REPORT
    }
}

pub fn user_report(lang: &str) -> String {
    format!("report:users:{lang}")
}
