//! File name filters.
//!
//! Shell-style globs (`*`, `?`, `[set]`, `[!set]`, `\x`) plus:
//!
//! * a leading `!` turns the filter into an exclusion,
//! * `%t<c>` expands to a field of the current time (`%tY` year, `%tm`
//!   month, `%td` day, `%tj` day of year, `%tH` hour, `%tM` minute, `%tS`
//!   second, `%ta`/`%tA` weekday name, `%tb`/`%tB` month name, `%ty`
//!   two-digit year, `%tw` weekday number, `%tW`/`%tR` week of year
//!   starting Monday/Sunday, `%tU` seconds since the epoch),
//! * `%T<op><n><unit>` shifts the time used by later `%t` (`op` one of
//!   `+ - * / %`, unit `S`, `M`, `H` or `d`, seconds when omitted),
//! * `%h` expands to the local hostname.
//!
//! Expansion happens into a per-call token list, so concurrent callers
//! never share state.

use chrono::{DateTime, Local, TimeZone};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    Match,
    NoMatch,
    /// An exclusion filter (`!...`) matched.
    Excluded,
}

impl MatchResult {
    pub fn is_match(self) -> bool {
        self == MatchResult::Match
    }
}

/// Values substituted into `%t` and `%h`.
#[derive(Debug, Clone)]
pub struct Expansion {
    pub now: DateTime<Local>,
    pub hostname: String,
}

impl Expansion {
    pub fn current() -> Self {
        Self::at(Local::now())
    }

    pub fn at(now: DateTime<Local>) -> Self {
        let hostname = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { now, hostname }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(char),
    One,
    Star,
    Set { negated: bool, ranges: Vec<(char, char)> },
}

fn time_field(t: &DateTime<Local>, c: char) -> Option<String> {
    let fmt = match c {
        'a' => "%a",
        'A' => "%A",
        'b' => "%b",
        'B' => "%B",
        'd' => "%d",
        'j' => "%j",
        'y' => "%y",
        'Y' => "%Y",
        'm' => "%m",
        'R' => "%U",
        'w' => "%w",
        'W' => "%W",
        'H' => "%H",
        'M' => "%M",
        'S' => "%S",
        'U' => return Some(t.timestamp().to_string()),
        _ => return None,
    };
    Some(t.format(fmt).to_string())
}

/// Apply a `%T` modifier to epoch seconds.
fn shift_time(base: i64, op: char, amount: i64) -> i64 {
    match op {
        '+' => base.saturating_add(amount),
        '-' => base.saturating_sub(amount),
        '*' => base.saturating_mul(amount),
        '/' if amount != 0 => base / amount,
        '%' if amount != 0 => base - base.rem_euclid(amount),
        _ => base,
    }
}

fn compile(filter: &str, exp: &Expansion) -> Vec<Token> {
    let chars: Vec<char> = filter.chars().collect();
    let mut tokens = Vec::with_capacity(chars.len());
    let mut time = exp.now;
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                tokens.push(Token::Literal(chars[i + 1]));
                i += 2;
            }
            '*' => {
                if tokens.last() != Some(&Token::Star) {
                    tokens.push(Token::Star);
                }
                i += 1;
            }
            '?' => {
                tokens.push(Token::One);
                i += 1;
            }
            '[' => match parse_set(&chars, i) {
                Some((token, next)) => {
                    tokens.push(token);
                    i = next;
                }
                None => {
                    tokens.push(Token::Literal('['));
                    i += 1;
                }
            },
            '%' if chars.get(i + 1) == Some(&'t') && i + 2 < chars.len() => {
                match time_field(&time, chars[i + 2]) {
                    Some(text) => tokens.extend(text.chars().map(Token::Literal)),
                    None => tokens.extend(chars[i..i + 3].iter().copied().map(Token::Literal)),
                }
                i += 3;
            }
            '%' if chars.get(i + 1) == Some(&'T') => {
                let op = chars.get(i + 2).copied().unwrap_or(' ');
                let mut j = i + 3;
                let mut amount: i64 = 0;
                while let Some(d) = chars.get(j).and_then(|c| c.to_digit(10)) {
                    amount = amount.saturating_mul(10).saturating_add(i64::from(d));
                    j += 1;
                }
                let unit = match chars.get(j) {
                    Some('S') => {
                        j += 1;
                        1
                    }
                    Some('M') => {
                        j += 1;
                        60
                    }
                    Some('H') => {
                        j += 1;
                        3600
                    }
                    Some('d') => {
                        j += 1;
                        86400
                    }
                    _ => 1,
                };
                let shifted = shift_time(time.timestamp(), op, amount.saturating_mul(unit));
                if let Some(t) = Local.timestamp_opt(shifted, 0).single() {
                    time = t;
                }
                i = j;
            }
            '%' if chars.get(i + 1) == Some(&'h') => {
                tokens.extend(exp.hostname.chars().map(Token::Literal));
                i += 2;
            }
            c => {
                tokens.push(Token::Literal(c));
                i += 1;
            }
        }
    }
    tokens
}

/// Parse `[...]` starting at `start`; `None` when it is not closed.
fn parse_set(chars: &[char], start: usize) -> Option<(Token, usize)> {
    let mut i = start + 1;
    let negated = matches!(chars.get(i), Some('!') | Some('^'));
    if negated {
        i += 1;
    }
    let mut ranges = Vec::new();
    let mut first = true;
    loop {
        let c = *chars.get(i)?;
        if c == ']' && !first {
            return Some((Token::Set { negated, ranges }, i + 1));
        }
        first = false;
        let lo = if c == '\\' {
            i += 1;
            *chars.get(i)?
        } else {
            c
        };
        if chars.get(i + 1) == Some(&'-') && chars.get(i + 2).is_some_and(|&c| c != ']') {
            let hi = chars[i + 2];
            ranges.push((lo, hi));
            i += 3;
        } else {
            ranges.push((lo, lo));
            i += 1;
        }
    }
}

fn token_matches(token: &Token, c: char) -> bool {
    match token {
        Token::Literal(l) => *l == c,
        Token::One => true,
        Token::Set { negated, ranges } => {
            ranges.iter().any(|&(lo, hi)| lo <= c && c <= hi) != *negated
        }
        Token::Star => false,
    }
}

fn glob(tokens: &[Token], name: &[char]) -> bool {
    let (mut t, mut n) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while n < name.len() {
        match tokens.get(t) {
            Some(Token::Star) => {
                backtrack = Some((t, n));
                t += 1;
            }
            Some(tok) if token_matches(tok, name[n]) => {
                t += 1;
                n += 1;
            }
            _ => match backtrack {
                Some((st, sn)) => {
                    t = st + 1;
                    n = sn + 1;
                    backtrack = Some((st, sn + 1));
                }
                None => return false,
            },
        }
    }
    tokens[t..].iter().all(|tok| *tok == Token::Star)
}

/// Match `name` against `filter` with explicit expansion values.
pub fn pmatch_with(filter: &str, name: &str, exp: &Expansion) -> MatchResult {
    let (inverted, pattern) = match filter.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, filter),
    };
    let tokens = compile(pattern, exp);
    let name: Vec<char> = name.chars().collect();
    match (glob(&tokens, &name), inverted) {
        (true, false) => MatchResult::Match,
        (true, true) => MatchResult::Excluded,
        (false, false) => MatchResult::NoMatch,
        (false, true) => MatchResult::Match,
    }
}

/// Match `name` against `filter`, expanding `%t` at `now` (or the current
/// time).
pub fn pmatch(filter: &str, name: &str, now: Option<DateTime<Local>>) -> MatchResult {
    let exp = match now {
        Some(t) => Expansion::at(t),
        None => Expansion::current(),
    };
    pmatch_with(filter, name, &exp)
}

/// Whether `name` is selected by a filter list: an exclusion that matches
/// wins, otherwise any positive match selects.
pub fn match_any<S: AsRef<str>>(filters: &[S], name: &str, exp: &Expansion) -> bool {
    let mut selected = false;
    for filter in filters {
        let filter = filter.as_ref();
        match pmatch_with(filter, name, exp) {
            MatchResult::Excluded => return false,
            MatchResult::Match if !filter.starts_with('!') => selected = true,
            _ => {}
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, mi: u32, s: u32) -> Expansion {
        Expansion {
            now: Local.with_ymd_and_hms(y, m, d, h, mi, s).unwrap(),
            hostname: "node7".to_string(),
        }
    }

    fn m(filter: &str, name: &str) -> MatchResult {
        pmatch_with(filter, name, &at(2025, 6, 15, 12, 0, 0))
    }

    #[test]
    fn test_basic_globs() {
        assert_eq!(m("*.dat", "foo.dat"), MatchResult::Match);
        assert_eq!(m("*.dat", "foo.dat.tmp"), MatchResult::NoMatch);
        assert_eq!(m("f?o*", "foo"), MatchResult::Match);
        assert_eq!(m("[!a]*", "abc"), MatchResult::NoMatch);
        assert_eq!(m("[!a]*", "bbc"), MatchResult::Match);
        assert_eq!(m("[a-c]x", "bx"), MatchResult::Match);
        assert_eq!(m("[a-c]x", "dx"), MatchResult::NoMatch);
        assert_eq!(m("a\\*b", "a*b"), MatchResult::Match);
        assert_eq!(m("a\\*b", "axb"), MatchResult::NoMatch);
        assert_eq!(m("*", ""), MatchResult::Match);
        assert_eq!(m("[]]", "]"), MatchResult::Match);
        assert_eq!(m("[abc", "[abc"), MatchResult::Match);
        assert_eq!(m("*a*b*c", "xxaxxbxxc"), MatchResult::Match);
    }

    #[test]
    fn test_exclusion() {
        assert_eq!(m("!x*", "xyz"), MatchResult::Excluded);
        assert!(!m("!x*", "xyz").is_match());
        assert_eq!(m("!x*", "abc"), MatchResult::Match);
    }

    #[test]
    fn test_time_expansion() {
        for (mo, d, h) in [(1, 1, 0), (6, 15, 12), (12, 31, 23)] {
            let exp = at(2025, mo, d, h, 59, 59);
            assert!(pmatch_with("%tY.txt", "2025.txt", &exp).is_match());
        }
        let exp = at(2025, 3, 7, 8, 5, 0);
        assert!(pmatch_with("data_%tY%tm%td_%tH*", "data_20250307_08x", &exp).is_match());
        assert!(pmatch_with("%tj", "066", &exp).is_match());
        assert!(pmatch_with("%tb", "Mar", &exp).is_match());
    }

    #[test]
    fn test_time_modifier() {
        let exp = at(2025, 3, 7, 8, 5, 0);
        assert!(pmatch_with("%T-1d%td.log", "06.log", &exp).is_match());
        assert!(pmatch_with("%T+2H%tH", "10", &exp).is_match());
        assert!(pmatch_with("%T-30M%tH%tM", "0735", &exp).is_match());
        // Modifiers accumulate; the first %td still sees the original day.
        assert!(pmatch_with("%td_%T+1d%td", "07_08", &exp).is_match());
    }

    #[test]
    fn test_hostname_expansion() {
        let exp = at(2025, 1, 1, 0, 0, 0);
        assert!(pmatch_with("%h_*", "node7_abc", &exp).is_match());
        assert!(!pmatch_with("%h_*", "node8_abc", &exp).is_match());
    }

    #[test]
    fn test_filter_lists() {
        let exp = at(2025, 1, 1, 0, 0, 0);
        let filters = ["*.dat", "!secret*"];
        assert!(match_any(&filters, "a.dat", &exp));
        assert!(!match_any(&filters, "secret.dat", &exp));
        assert!(!match_any(&filters, "a.txt", &exp));
    }

    #[test]
    fn test_shift_time() {
        assert_eq!(shift_time(100, '+', 5), 105);
        assert_eq!(shift_time(100, '%', 30), 90);
        assert_eq!(shift_time(100, '/', 0), 100);
    }
}
