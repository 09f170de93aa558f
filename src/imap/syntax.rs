//-
// Copyright (c) 2024, 2025, Jason Lingle
//
// This file is part of Tridove.
//
// Tridove is free software: you can  redistribute it and/or modify it under
// the terms  of the GNU General  Public License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Tridove is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without  even the implied  warranty of  MERCHANTABILITY or
// FITNESS FOR  A PARTICULAR PURPOSE.  See the  GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Tridove. If not, see <http://www.gnu.org/licenses/>.

//! Tokenizing for IMAP command arguments.
//!
//! The grammar implemented here is flat: atoms, quoted strings, sequence
//! sets, fetch items, a linear list of search keys, and store actions.
//! Literals (`{n}`) are not supported; a client sending one gets a syntax
//! error, which also rules out APPEND.

use chrono::{DateTime, Local};

/// A command line split into its fixed frame: `<tag> SP <NAME> [SP args]`.
///
/// The name is uppercased; the arguments keep their original form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandLine {
    pub tag: String,
    pub name: String,
    pub arguments: String,
}

pub fn parse_command_line(line: &str) -> Option<CommandLine> {
    let line = line.trim_start();
    let (tag, rest) = line.split_once(' ')?;
    if tag.is_empty() {
        return None;
    }

    let rest = rest.trim_start();
    let (name, arguments) = match rest.split_once(' ') {
        Some((name, arguments)) => (name, arguments.trim_start()),
        None => (rest, ""),
    };
    if name.is_empty() {
        return None;
    }

    Some(CommandLine {
        tag: tag.to_owned(),
        name: name.to_ascii_uppercase(),
        arguments: arguments.to_owned(),
    })
}

/// A set of message sequence numbers or UIDs.
///
/// `*` is the "all above" sentinel: it parses to the maximum value, so
/// `N:*` covers everything from N up.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequenceSet {
    ranges: Vec<(u32, u32)>,
}

impl SequenceSet {
    pub fn parse(s: &str) -> Option<Self> {
        if s.is_empty() {
            return None;
        }

        let mut ranges = Vec::new();
        for token in s.split(',') {
            let range = match token.split_once(':') {
                Some((start, end)) => {
                    let start = parse_seq_number(start)?;
                    let end = parse_seq_number(end)?;
                    (start.min(end), start.max(end))
                },
                None => {
                    let n = parse_seq_number(token)?;
                    (n, n)
                },
            };
            ranges.push(range);
        }

        Some(SequenceSet { ranges })
    }

    pub fn contains(&self, num: u32) -> bool {
        self.ranges
            .iter()
            .any(|&(start, end)| num >= start && num <= end)
    }
}

fn parse_seq_number(token: &str) -> Option<u32> {
    if "*" == token {
        Some(u32::MAX)
    } else {
        token.parse::<u32>().ok().filter(|&n| n > 0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchItemKind {
    All,
    Fast,
    Full,
    Envelope,
    Flags,
    InternalDate,
    Rfc822,
    Rfc822Header,
    Rfc822Size,
    Rfc822Text,
    Body,
    BodyPeek,
    BodyStructure,
    Uid,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchItem {
    pub kind: FetchItemKind,
    /// The text between `[` and `]` for BODY/BODY.PEEK, uppercased.
    pub section: Option<String>,
}

impl FetchItem {
    fn bare(kind: FetchItemKind) -> Self {
        FetchItem {
            kind,
            section: None,
        }
    }
}

/// Parse the item list of a FETCH command, parenthesized or not.
///
/// Unknown items are skipped rather than rejected.
pub fn parse_fetch_items(s: &str) -> Vec<FetchItem> {
    let s = s.trim();
    let s = s
        .strip_prefix('(')
        .map(|s| s.strip_suffix(')').unwrap_or(s))
        .unwrap_or(s);

    let mut items = Vec::new();
    for token in s.split_ascii_whitespace() {
        let token = token.to_ascii_uppercase();

        let item = match token.as_str() {
            "ALL" => FetchItem::bare(FetchItemKind::All),
            "FAST" => FetchItem::bare(FetchItemKind::Fast),
            "FULL" => FetchItem::bare(FetchItemKind::Full),
            "ENVELOPE" => FetchItem::bare(FetchItemKind::Envelope),
            "FLAGS" => FetchItem::bare(FetchItemKind::Flags),
            "INTERNALDATE" => FetchItem::bare(FetchItemKind::InternalDate),
            "RFC822" => FetchItem::bare(FetchItemKind::Rfc822),
            "RFC822.HEADER" => FetchItem::bare(FetchItemKind::Rfc822Header),
            "RFC822.SIZE" => FetchItem::bare(FetchItemKind::Rfc822Size),
            "RFC822.TEXT" => FetchItem::bare(FetchItemKind::Rfc822Text),
            "BODYSTRUCTURE" => FetchItem::bare(FetchItemKind::BodyStructure),
            "UID" => FetchItem::bare(FetchItemKind::Uid),
            _ if token.starts_with("BODY.PEEK") => FetchItem {
                kind: FetchItemKind::BodyPeek,
                section: bracket_section(&token),
            },
            _ if token.starts_with("BODY") => FetchItem {
                kind: FetchItemKind::Body,
                section: bracket_section(&token),
            },
            _ => continue,
        };

        items.push(item);
    }

    items
}

fn bracket_section(token: &str) -> Option<String> {
    let open = token.find('[')?;
    let close = token[open..].find(']')? + open;
    Some(token[open + 1..close].to_owned())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchKeyKind {
    All,
    Answered,
    Deleted,
    Draft,
    Flagged,
    New,
    Old,
    Recent,
    Seen,
    Unanswered,
    Undeleted,
    Undraft,
    Unflagged,
    Unseen,
    From,
    To,
    Cc,
    Bcc,
    Subject,
    Body,
    Text,
    Larger,
    Smaller,
    Before,
    On,
    Since,
    Uid,
    // Recognized so a query using them still parses; evaluation treats the
    // surrounding list as a flat conjunction.
    Not,
    Or,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchKey {
    pub kind: SearchKeyKind,
    pub value: String,
}

/// Parse SEARCH arguments into a flat list of keys.
///
/// Keys taking an argument consume the following token; unknown tokens are
/// skipped.
pub fn parse_search_criteria(s: &str) -> Vec<SearchKey> {
    use self::SearchKeyKind::*;

    let mut criteria = Vec::new();
    let mut tokens = s.split_ascii_whitespace();

    while let Some(token) = tokens.next() {
        let token = token.to_ascii_uppercase();

        let (kind, takes_value) = match token.as_str() {
            "ALL" => (All, false),
            "ANSWERED" => (Answered, false),
            "DELETED" => (Deleted, false),
            "DRAFT" => (Draft, false),
            "FLAGGED" => (Flagged, false),
            "NEW" => (New, false),
            "OLD" => (Old, false),
            "RECENT" => (Recent, false),
            "SEEN" => (Seen, false),
            "UNANSWERED" => (Unanswered, false),
            "UNDELETED" => (Undeleted, false),
            "UNDRAFT" => (Undraft, false),
            "UNFLAGGED" => (Unflagged, false),
            "UNSEEN" => (Unseen, false),
            "FROM" => (From, true),
            "TO" => (To, true),
            "CC" => (Cc, true),
            "BCC" => (Bcc, true),
            "SUBJECT" => (Subject, true),
            "BODY" => (Body, true),
            "TEXT" => (Text, true),
            "LARGER" => (Larger, true),
            "SMALLER" => (Smaller, true),
            "BEFORE" => (Before, true),
            "ON" => (On, true),
            "SINCE" => (Since, true),
            "UID" => (Uid, true),
            "NOT" => (Not, false),
            "OR" => (Or, false),
            _ => continue,
        };

        criteria.push(SearchKey {
            kind,
            value: if takes_value {
                tokens.next().unwrap_or("").to_owned()
            } else {
                String::new()
            },
        });
    }

    criteria
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreActionKind {
    Replace,
    Add,
    Remove,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreAction {
    pub kind: StoreActionKind,
    pub silent: bool,
    pub flags: Vec<String>,
}

pub fn parse_store_action(s: &str) -> Option<StoreAction> {
    let s = s.trim();
    let (action, rest) = match s.split_once(' ') {
        Some((action, rest)) => (action, rest),
        None => (s, ""),
    };
    let action = action.to_ascii_uppercase();

    let (action, silent) = match action.strip_suffix(".SILENT") {
        Some(action) => (action, true),
        None => (action.as_str(), false),
    };

    let kind = match action {
        "FLAGS" => StoreActionKind::Replace,
        "+FLAGS" => StoreActionKind::Add,
        "-FLAGS" => StoreActionKind::Remove,
        _ => return None,
    };

    Some(StoreAction {
        kind,
        silent,
        flags: parse_flag_list(rest),
    })
}

/// Parse a whitespace-separated flag list with optional parentheses.
pub fn parse_flag_list(s: &str) -> Vec<String> {
    let s = s.trim();
    let s = s
        .strip_prefix('(')
        .map(|s| s.strip_suffix(')').unwrap_or(s))
        .unwrap_or(s);

    s.split_ascii_whitespace().map(str::to_owned).collect()
}

/// Parse an atom or quoted string starting at `*pos`, advancing past it.
///
/// Literals are unsupported and parse as `None`.
pub fn parse_string(input: &str, pos: &mut usize) -> Option<String> {
    skip_whitespace(input, pos);
    let bytes = input.as_bytes();

    match bytes.get(*pos) {
        None => None,

        Some(&b'"') => {
            *pos += 1;
            let mut result = String::new();
            while let Some(&ch) = bytes.get(*pos) {
                match ch {
                    b'"' => {
                        *pos += 1;
                        return Some(result);
                    },
                    b'\\' => {
                        *pos += 1;
                        if let Some(&escaped) = bytes.get(*pos) {
                            result.push(escaped as char);
                            *pos += 1;
                        }
                    },
                    _ => {
                        result.push(ch as char);
                        *pos += 1;
                    },
                }
            }
            // Unterminated string; accept what we have, as the original
            // parser did
            Some(result)
        },

        Some(&b'{') => None,

        Some(_) => parse_atom(input, pos),
    }
}

pub fn parse_atom(input: &str, pos: &mut usize) -> Option<String> {
    skip_whitespace(input, pos);

    let start = *pos;
    let bytes = input.as_bytes();
    while let Some(&ch) = bytes.get(*pos) {
        if !is_atom_char(ch as char) {
            break;
        }
        *pos += 1;
    }

    if start == *pos {
        None
    } else {
        Some(input[start..*pos].to_owned())
    }
}

fn skip_whitespace(input: &str, pos: &mut usize) {
    let bytes = input.as_bytes();
    while bytes.get(*pos).is_some_and(|b| b.is_ascii_whitespace()) {
        *pos += 1;
    }
}

/// Whether `c` may appear in an atom.
///
/// Excludes SP, CTL, and `( ) { " \ % * [ ]`.
pub fn is_atom_char(c: char) -> bool {
    if c.is_ascii_whitespace() || c.is_ascii_control() {
        return false;
    }
    !matches!(c, '(' | ')' | '{' | '"' | '\\' | '%' | '*' | '[' | ']')
}

/// Quote a string for output: returned verbatim if it is a plain atom,
/// otherwise wrapped in quotes with `"` and `\` escaped.
pub fn quote_string(s: &str) -> String {
    if !s.is_empty() && s.chars().all(is_atom_char) {
        return s.to_owned();
    }

    let mut result = String::with_capacity(s.len() + 2);
    result.push('"');
    for c in s.chars() {
        if '"' == c || '\\' == c {
            result.push('\\');
        }
        result.push(c);
    }
    result.push('"');
    result
}

/// Format a flag list: `(flag1 flag2 ...)`.
pub fn format_flags<'a>(flags: impl IntoIterator<Item = &'a str>) -> String {
    let mut result = String::from("(");
    for (ix, flag) in flags.into_iter().enumerate() {
        if ix > 0 {
            result.push(' ');
        }
        result.push_str(flag);
    }
    result.push(')');
    result
}

/// Format an INTERNALDATE value: `"DD-Mon-YYYY HH:MM:SS +ZZZZ"`.
pub fn format_internal_date(date: DateTime<Local>) -> String {
    date.format("\"%d-%b-%Y %H:%M:%S %z\"").to_string()
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn command_line_parsing() {
        assert_eq!(
            Some(CommandLine {
                tag: "A1".to_owned(),
                name: "LOGIN".to_owned(),
                arguments: "user pass".to_owned(),
            }),
            parse_command_line("A1 login user pass")
        );
        assert_eq!(
            Some(CommandLine {
                tag: "A2".to_owned(),
                name: "NOOP".to_owned(),
                arguments: String::new(),
            }),
            parse_command_line("A2 NOOP")
        );
        assert_eq!(None, parse_command_line(""));
        assert_eq!(None, parse_command_line("lonesometag"));
    }

    #[test]
    fn sequence_set_parsing() {
        let set = SequenceSet::parse("1").unwrap();
        assert!(set.contains(1));
        assert!(!set.contains(2));

        let set = SequenceSet::parse("2:4").unwrap();
        assert!(!set.contains(1));
        assert!(set.contains(2));
        assert!(set.contains(3));
        assert!(set.contains(4));
        assert!(!set.contains(5));

        // Ranges are normalized so start <= end
        assert_eq!(SequenceSet::parse("4:2"), SequenceSet::parse("2:4"));

        let set = SequenceSet::parse("1,3,5:7").unwrap();
        assert!(set.contains(1));
        assert!(!set.contains(2));
        assert!(set.contains(3));
        assert!(set.contains(6));
        assert!(!set.contains(8));

        // 1:* contains every positive integer
        let set = SequenceSet::parse("1:*").unwrap();
        assert!(set.contains(1));
        assert!(set.contains(12345));
        assert!(set.contains(u32::MAX));

        let set = SequenceSet::parse("3:*").unwrap();
        assert!(!set.contains(2));
        assert!(set.contains(3));
        assert!(set.contains(u32::MAX));

        assert_eq!(None, SequenceSet::parse(""));
        assert_eq!(None, SequenceSet::parse("a"));
        assert_eq!(None, SequenceSet::parse("1:b"));
        assert_eq!(None, SequenceSet::parse("0"));
    }

    #[test]
    fn fetch_item_parsing() {
        let items = parse_fetch_items("(UID FLAGS RFC822.SIZE)");
        assert_eq!(
            vec![
                FetchItem::bare(FetchItemKind::Uid),
                FetchItem::bare(FetchItemKind::Flags),
                FetchItem::bare(FetchItemKind::Rfc822Size),
            ],
            items
        );

        let items = parse_fetch_items("body[]");
        assert_eq!(FetchItemKind::Body, items[0].kind);
        assert_eq!(Some(String::new()), items[0].section);

        let items = parse_fetch_items("BODY.PEEK[HEADER]");
        assert_eq!(FetchItemKind::BodyPeek, items[0].kind);
        assert_eq!(Some("HEADER".to_owned()), items[0].section);

        let items = parse_fetch_items("FLAGS BOGUS UID");
        assert_eq!(2, items.len());

        let items = parse_fetch_items("INTERNALDATE ENVELOPE ALL FAST FULL");
        assert_eq!(5, items.len());
    }

    #[test]
    fn search_criteria_parsing() {
        use super::SearchKeyKind::*;

        let criteria = parse_search_criteria("UNSEEN LARGER 1024");
        assert_eq!(2, criteria.len());
        assert_eq!(Unseen, criteria[0].kind);
        assert_eq!(Larger, criteria[1].kind);
        assert_eq!("1024", criteria[1].value);

        let criteria = parse_search_criteria("uid 1:5 from zim");
        assert_eq!(Uid, criteria[0].kind);
        assert_eq!("1:5", criteria[0].value);
        assert_eq!(From, criteria[1].kind);
        assert_eq!("zim", criteria[1].value);

        // Connectives are recognized but valueless
        let criteria = parse_search_criteria("NOT SEEN OR ANSWERED DELETED");
        assert_eq!(
            vec![Not, Seen, Or, Answered, Deleted],
            criteria.iter().map(|c| c.kind).collect::<Vec<_>>()
        );

        assert!(parse_search_criteria("").is_empty());
    }

    #[test]
    fn store_action_parsing() {
        let action = parse_store_action("FLAGS (\\Seen \\Draft)").unwrap();
        assert_eq!(StoreActionKind::Replace, action.kind);
        assert!(!action.silent);
        assert_eq!(vec!["\\Seen".to_owned(), "\\Draft".to_owned()], action.flags);

        let action = parse_store_action("+FLAGS.SILENT \\Deleted").unwrap();
        assert_eq!(StoreActionKind::Add, action.kind);
        assert!(action.silent);
        assert_eq!(vec!["\\Deleted".to_owned()], action.flags);

        let action = parse_store_action("-flags (\\Flagged)").unwrap();
        assert_eq!(StoreActionKind::Remove, action.kind);

        assert_eq!(None, parse_store_action("SOMETHING (\\Seen)"));
        assert_eq!(None, parse_store_action(""));
    }

    #[test]
    fn string_parsing() {
        let mut pos = 0;
        assert_eq!(
            Some("INBOX".to_owned()),
            parse_string("INBOX", &mut pos)
        );

        let mut pos = 0;
        assert_eq!(
            Some("My Folder".to_owned()),
            parse_string("\"My Folder\" rest", &mut pos)
        );
        assert_eq!(
            Some("rest".to_owned()),
            parse_string("\"My Folder\" rest", &mut pos)
        );

        let mut pos = 0;
        assert_eq!(
            Some("a\"b\\c".to_owned()),
            parse_string(r#""a\"b\\c""#, &mut pos)
        );

        // Literals are not supported
        let mut pos = 0;
        assert_eq!(None, parse_string("{5}", &mut pos));

        let mut pos = 0;
        assert_eq!(None, parse_string("", &mut pos));
    }

    #[test]
    fn quote_string_round_trips() {
        // A plain atom stays bare
        assert_eq!("INBOX", quote_string("INBOX"));
        assert_eq!("Sent", quote_string("Sent"));

        assert_eq!("\"My Folder\"", quote_string("My Folder"));
        assert_eq!("\"\"", quote_string(""));
        assert_eq!(r#""a\"b""#, quote_string("a\"b"));
        assert_eq!(r#""a\\b""#, quote_string("a\\b"));

        for input in ["INBOX", "My Folder", "a\"b", "a\\b", "x y z"] {
            let quoted = quote_string(input);
            let mut pos = 0;
            assert_eq!(
                Some(input.to_owned()),
                parse_string(&quoted, &mut pos),
                "round trip failed for {input:?}"
            );
        }
    }

    #[test]
    fn flag_formatting() {
        assert_eq!("()", format_flags(Vec::<&str>::new()));
        assert_eq!("(\\Seen)", format_flags(["\\Seen"]));
        assert_eq!(
            "(\\Answered \\Seen)",
            format_flags(["\\Answered", "\\Seen"])
        );
    }

    #[test]
    fn internal_date_formatting() {
        let date = Local.with_ymd_and_hms(2024, 3, 9, 4, 5, 6).unwrap();
        let formatted = format_internal_date(date);
        assert!(formatted.starts_with("\"09-Mar-2024 04:05:06 "));
        assert!(formatted.ends_with('"'));
    }
}
