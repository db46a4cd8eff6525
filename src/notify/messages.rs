use crate::config::SlipConfig;

pub fn build_complete_subject(
    build_name: &str,
    score: f64,
    full_score: f64,
    affected: bool,
    slip_units: i64,
    slip: &SlipConfig,
) -> String {
    let suffix = if !affected {
        " (no effect on grade)".to_string()
    } else if slip_units == 1 {
        format!(" (1 {} used)", slip.unit_name_singular)
    } else if slip_units > 1 {
        format!(" ({} slip {} used)", slip_units, slip.unit_name_plural)
    } else {
        String::new()
    };
    format!(
        "{} complete - score {} / {}{}",
        build_name, score, full_score, suffix
    )
}

pub fn build_failed_subject(build_name: &str) -> String {
    format!("{} failed to complete", build_name)
}

pub fn critical_failure_subject(build_name: &str) -> String {
    format!("Critical failure in {}", build_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_subject_suffixes() {
        let slip = SlipConfig::default();
        assert_eq!(
            build_complete_subject("hw1-build-7", 9.5, 10.0, true, 0, &slip),
            "hw1-build-7 complete - score 9.5 / 10"
        );
        assert_eq!(
            build_complete_subject("hw1-build-7", 9.5, 10.0, true, 1, &slip),
            "hw1-build-7 complete - score 9.5 / 10 (1 slip day used)"
        );
        assert_eq!(
            build_complete_subject("hw1-build-7", 9.5, 10.0, true, 3, &slip),
            "hw1-build-7 complete - score 9.5 / 10 (3 slip days used)"
        );
        assert_eq!(
            build_complete_subject("hw1-build-7", 9.5, 10.0, false, 3, &slip),
            "hw1-build-7 complete - score 9.5 / 10 (no effect on grade)"
        );
    }

    #[test]
    fn failure_subject() {
        assert_eq!(build_failed_subject("hw2-build-1"), "hw2-build-1 failed to complete");
    }
}
