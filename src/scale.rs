//! Seismic intensity scale codec.
//!
//! The feed encodes intensity as an integer (10, 20, ... 70). This module maps
//! those codes to the display sign ("5-", "6+"), the spoken form ("5弱", "6強")
//! and the kana pair used to patch the synthesizer's pronunciation.

use std::fmt;

use thiserror::Error;

/// Sentinel used by early warnings when an intensity bound is unknown.
pub const SCALE_UNKNOWN: i32 = 99;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScaleError {
    #[error("Unknown intensity scale: {0}")]
    UnknownScale(i32),

    #[error("Unknown intensity sign: {0:?}")]
    UnknownSign(String),
}

/// One level of the intensity scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scale {
    One,
    Two,
    Three,
    Four,
    FiveLower,
    FiveUpper,
    SixLower,
    SixUpper,
    Seven,
}

impl Scale {
    pub const ALL: [Scale; 9] = [
        Scale::One,
        Scale::Two,
        Scale::Three,
        Scale::Four,
        Scale::FiveLower,
        Scale::FiveUpper,
        Scale::SixLower,
        Scale::SixUpper,
        Scale::Seven,
    ];

    /// Resolve a feed intensity code.
    pub fn from_code(code: i32) -> Result<Self, ScaleError> {
        Self::ALL
            .into_iter()
            .find(|s| s.code() == code)
            .ok_or(ScaleError::UnknownScale(code))
    }

    /// Resolve a display sign such as `"4"` or `"5-"`.
    pub fn from_sign(sign: &str) -> Result<Self, ScaleError> {
        Self::ALL
            .into_iter()
            .find(|s| s.sign() == sign)
            .ok_or_else(|| ScaleError::UnknownSign(sign.to_string()))
    }

    pub fn code(self) -> i32 {
        match self {
            Self::One => 10,
            Self::Two => 20,
            Self::Three => 30,
            Self::Four => 40,
            Self::FiveLower => 45,
            Self::FiveUpper => 50,
            Self::SixLower => 55,
            Self::SixUpper => 60,
            Self::Seven => 70,
        }
    }

    pub fn sign(self) -> &'static str {
        match self {
            Self::One => "1",
            Self::Two => "2",
            Self::Three => "3",
            Self::Four => "4",
            Self::FiveLower => "5-",
            Self::FiveUpper => "5+",
            Self::SixLower => "6-",
            Self::SixUpper => "6+",
            Self::Seven => "7",
        }
    }

    /// Sign with a trailing `-` read as 弱 and a trailing `+` read as 強.
    pub fn spoken_form(self) -> String {
        let sign = self.sign();
        if let Some(base) = sign.strip_suffix('-') {
            format!("{base}弱")
        } else if let Some(base) = sign.strip_suffix('+') {
            format!("{base}強")
        } else {
            sign.to_string()
        }
    }

    /// `(source, corrected)` kana fragments. The engine's default accent for
    /// "震度N" runs the words together; the corrected form splits them.
    pub fn phonetic_pair(self) -> (&'static str, &'static str) {
        match self {
            Self::One => ("シンド'イチ", "シ'ンド/イチ'"),
            Self::Two => ("シンド'ニ", "シ'ンド/ニ'"),
            Self::Three => ("シンド'サン", "シ'ンド/サ'ン"),
            Self::Four => ("シンドヨ'ン", "シ'ンド/ヨ'ン"),
            Self::FiveLower => ("シンドゴジャ'ク", "シ'ンド/ゴ'/ジャ'ク"),
            Self::FiveUpper => ("シンドゴキョ'オ", "シ'ンド/ゴ'/キョ'オ"),
            Self::SixLower => ("シンドロクジャ'ク", "シ'ンド/ロク'/ジャ'ク"),
            Self::SixUpper => ("シンドロ_クキョ'オ", "シ'ンド/ロク'/キョ'オ"),
            Self::Seven => ("シンド'ナナ", "シ'ンド/ナ'ナ"),
        }
    }
}

impl fmt::Display for Scale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sign())
    }
}

/// clap value parser for `--silent`.
pub fn parse_sign(sign: &str) -> Result<Scale, String> {
    Scale::from_sign(sign).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_cover_every_scale() {
        for scale in Scale::ALL {
            assert_eq!(Scale::from_code(scale.code()).unwrap(), scale);
            assert_eq!(Scale::from_sign(scale.sign()).unwrap(), scale);
            let (from, to) = scale.phonetic_pair();
            assert!(from.starts_with("シンド"));
            assert!(to.starts_with("シ'ンド/"));
        }
    }

    #[test]
    fn test_spoken_form_replaces_suffix() {
        let spoken = |code| Scale::from_code(code).unwrap().spoken_form();
        assert_eq!(Scale::from_code(45).unwrap().sign(), "5-");
        assert_eq!(spoken(45), "5弱");
        assert_eq!(spoken(50), "5強");
        assert_eq!(spoken(60), "6強");
        assert_eq!(spoken(40), "4");
        assert_eq!(spoken(70), "7");
    }

    #[test]
    fn test_unknown_values() {
        assert_eq!(Scale::from_code(SCALE_UNKNOWN), Err(ScaleError::UnknownScale(99)));
        assert_eq!(Scale::from_code(46), Err(ScaleError::UnknownScale(46)));
        assert!(matches!(Scale::from_sign("8"), Err(ScaleError::UnknownSign(_))));
        assert!(parse_sign("5").is_err());
    }

    #[test]
    fn test_order_follows_intensity() {
        assert!(Scale::Four < Scale::FiveLower);
        assert!(Scale::FiveUpper < Scale::SixLower);
        let codes: Vec<i32> = Scale::ALL.iter().map(|s| s.code()).collect();
        let mut sorted = codes.clone();
        sorted.sort();
        assert_eq!(codes, sorted);
    }
}
