//-
// Copyright (c) 2024, Jason Lingle
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

/// Determine whether the given mailbox name is "safe".
///
/// Mailbox names become file system elements (with `/` rewritten to `.` in
/// the maildir layout), so this excludes empty names and patterns that cause
/// directory traversal or other unwanted behaviours, as well as things that
/// have special meaning within IMAP.
///
/// `/` itself is allowed: it is the IMAP hierarchy delimiter and is mapped
/// before touching the file system. `.` is rejected everywhere because it is
/// the on-disk hierarchy encoding.
///
/// This does not care about whether the name is ultimately a valid file
/// name; for that, we simply rely on the OS rejecting it.
pub fn is_safe_mailbox_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('/')
        && !name.ends_with('/')
        && !name.contains("//")
        && !name.chars().any(is_forbidden_char)
}

fn is_forbidden_char(ch: char) -> bool {
    match ch {
        // The on-disk hierarchy encoding; a '.' in a name component would
        // alias another mailbox
        '.' |
        // Only a path separator on Windows, but always block since it has
        // high potential of causing problems
        '\\' |
        // Don't allow any ASCII control characters
        '\0'..='\x1F' | '\x7F' |
        // * and % are very special in *some* IMAP contexts, so forbid
        // everywhere
        '*' | '%' |
        // RFC 5198 forbids C1 control characters
        '\u{80}'..='\u{9F}' |
        // RFC 6855 forbids the Unicode LINE SEPARATOR and PARAGRAPH
        // SEPARATOR characters
        '\u{2028}' | '\u{2029}' => true,
        _ => false,
    }
}

#[cfg(test)]
mod test {
    use super::is_safe_mailbox_name;

    #[test]
    fn test_is_safe_mailbox_name() {
        assert!(is_safe_mailbox_name("foo"));
        assert!(is_safe_mailbox_name("INBOX"));
        assert!(is_safe_mailbox_name("Entwürfe"));
        assert!(is_safe_mailbox_name("郵便"));
        assert!(is_safe_mailbox_name("folder #1"));
        assert!(is_safe_mailbox_name("Archive/2024"));
        assert!(!is_safe_mailbox_name("."));
        assert!(!is_safe_mailbox_name(".."));
        assert!(!is_safe_mailbox_name(".hidden"));
        assert!(!is_safe_mailbox_name("foo.bar"));
        assert!(!is_safe_mailbox_name("/foo"));
        assert!(!is_safe_mailbox_name("foo/"));
        assert!(!is_safe_mailbox_name("foo//bar"));
        assert!(!is_safe_mailbox_name("foo\\bar"));
        assert!(!is_safe_mailbox_name("foo\0"));
        assert!(!is_safe_mailbox_name("foo\r"));
        assert!(!is_safe_mailbox_name("fo\x7Fo"));
        assert!(!is_safe_mailbox_name("foo*bar"));
        assert!(!is_safe_mailbox_name("foo%bar"));
        assert!(!is_safe_mailbox_name(""));
    }
}
