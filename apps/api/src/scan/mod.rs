// CV scan: the metered resume-scoring feature. Scoring sits behind the
// `ResumeScorer` trait; every scan is paid for with one cvScan credit.

pub mod handlers;
pub mod scorer;
