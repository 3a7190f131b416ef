// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Unit-aware parsing for Slurm resource strings. Storage accepts the
//! k/m/g/t/p suffixes case-insensitively (plain numbers are megabytes, the
//! sbatch convention); walltime accepts `D-HH:MM:SS`, `HH:MM:SS`, `MM:SS`
//! and `MM`.

const KIB: u64 = 1024;

/// Parse a storage quantity into bytes. `"10G"`, `"512m"`, `"2048"`.
pub fn parse_storage(raw: &str) -> Option<u64> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    let (digits, suffix) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, ""),
    };
    let value: u64 = digits.parse().ok()?;
    let multiplier = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "m" | "mb" => KIB * KIB,
        "k" | "kb" => KIB,
        "g" | "gb" => KIB * KIB * KIB,
        "t" | "tb" => KIB * KIB * KIB * KIB,
        "p" | "pb" => KIB * KIB * KIB * KIB * KIB,
        _ => return None,
    };
    value.checked_mul(multiplier)
}

/// Render bytes as whole megabytes for `#SBATCH --mem` style options.
pub fn format_storage_mb(bytes: u64) -> String {
    let mb = bytes.div_ceil(KIB * KIB).max(1);
    format!("{mb}M")
}

/// Parse a Slurm walltime into seconds.
pub fn parse_walltime(raw: &str) -> Option<u64> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    // Optional leading days: "D-HH:MM:SS"
    let (days, rest) = match s.split_once('-') {
        Some((d, rest)) => (d.parse::<u64>().ok()?, rest),
        None => (0, s),
    };

    let parts: Vec<&str> = rest.split(':').collect();
    let (hours, minutes, seconds) = match parts.as_slice() {
        [h, m, sec] => (
            h.parse::<u64>().ok()?,
            m.parse::<u64>().ok()?,
            sec.parse::<u64>().ok()?,
        ),
        // Without a day prefix, two components mean "MM:SS".
        [m, sec] if days == 0 => (0, m.parse::<u64>().ok()?, sec.parse::<u64>().ok()?),
        [m] if days == 0 => (0, m.parse::<u64>().ok()?, 0),
        _ => return None,
    };

    Some(
        days.saturating_mul(24 * 3600)
            .saturating_add(hours * 3600)
            .saturating_add(minutes * 60)
            .saturating_add(seconds),
    )
}

/// Render seconds in the canonical `HH:MM:SS` (or `D-HH:MM:SS`) form.
pub fn format_walltime(total_secs: u64) -> String {
    let days = total_secs / (24 * 3600);
    let rem = total_secs % (24 * 3600);
    let hours = rem / 3600;
    let minutes = (rem % 3600) / 60;
    let seconds = rem % 60;
    if days > 0 {
        format!("{days}-{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_units_are_case_insensitive() {
        assert_eq!(parse_storage("1k"), Some(1024));
        assert_eq!(parse_storage("1K"), Some(1024));
        assert_eq!(parse_storage("10G"), Some(10 * 1024 * 1024 * 1024));
        assert_eq!(parse_storage("10g"), Some(10 * 1024 * 1024 * 1024));
        assert_eq!(parse_storage("2T"), Some(2 * 1024u64.pow(4)));
        assert_eq!(parse_storage("1p"), Some(1024u64.pow(5)));
    }

    #[test]
    fn plain_numbers_are_megabytes() {
        assert_eq!(parse_storage("512"), Some(512 * 1024 * 1024));
        assert_eq!(parse_storage("512m"), Some(512 * 1024 * 1024));
    }

    #[test]
    fn storage_rejects_garbage() {
        assert_eq!(parse_storage(""), None);
        assert_eq!(parse_storage("10x"), None);
        assert_eq!(parse_storage("G10"), None);
        assert_eq!(parse_storage("ten gigs"), None);
    }

    #[test]
    fn walltime_accepts_all_four_forms() {
        assert_eq!(parse_walltime("30"), Some(30 * 60));
        assert_eq!(parse_walltime("30:15"), Some(30 * 60 + 15));
        assert_eq!(parse_walltime("01:30:00"), Some(90 * 60));
        assert_eq!(parse_walltime("2-01:30:00"), Some(2 * 86400 + 90 * 60));
    }

    #[test]
    fn walltime_rejects_malformed_input() {
        assert_eq!(parse_walltime(""), None);
        assert_eq!(parse_walltime("1:2:3:4"), None);
        assert_eq!(parse_walltime("2-30"), None);
        assert_eq!(parse_walltime("an hour"), None);
    }

    #[test]
    fn walltime_formats_round_trip() {
        for raw in ["00:30:00", "10:00:00", "2-01:30:00"] {
            let secs = parse_walltime(raw).unwrap();
            assert_eq!(format_walltime(secs), raw);
        }
    }

    #[test]
    fn storage_formats_as_whole_megabytes() {
        assert_eq!(format_storage_mb(10 * 1024 * 1024 * 1024), "10240M");
        assert_eq!(format_storage_mb(1), "1M");
    }
}
