//! Minecraft Classic chat color codes (`&[0-9a-fr]`) translated to ANSI escapes,
//! used only by the optional chat-logging hook.

const RESET: &str = "\x1b[0m";

fn ansi_for(code: char) -> Option<&'static str> {
    Some(match code {
        '0' => "\x1b[30m",
        '1' => "\x1b[34m",
        '2' => "\x1b[32m",
        '3' => "\x1b[36m",
        '4' => "\x1b[31m",
        '5' => "\x1b[35m",
        '6' => "\x1b[33m",
        '7' => "\x1b[37m",
        '8' => "\x1b[1;30m",
        '9' => "\x1b[1;34m",
        'a' => "\x1b[1;32m",
        'b' => "\x1b[1;36m",
        'c' => "\x1b[1;31m",
        'd' => "\x1b[1;35m",
        'e' => "\x1b[1;33m",
        'f' => "\x1b[1;37m",
        'r' => RESET,
        _ => return None,
    })
}

/// Replaces `&X` color codes in a Classic chat string with ANSI escapes, for
/// printing to a terminal log. Unrecognized `&X` sequences pass through
/// unchanged. Operates on `char`s, not bytes, so multi-byte UTF-8 text
/// (accents, CJK, emoji — all legal in a Classic `Message`) survives intact.
pub fn colorify(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 8);
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '&' {
            if let Some(&next) = chars.peek() {
                if let Some(code) = ansi_for(next) {
                    out.push_str(code);
                    chars.next();
                    continue;
                }
            }
        }
        out.push(c);
    }
    out.push_str(RESET);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_through_plain_text() {
        assert_eq!(colorify("hello"), format!("hello{RESET}"));
    }

    #[test]
    fn translates_known_codes() {
        let out = colorify("&aHi&r there");
        assert!(out.starts_with("\x1b[1;32m"));
        assert!(out.contains("Hi"));
    }

    #[test]
    fn leaves_unknown_codes_alone() {
        let out = colorify("&zweird");
        assert!(out.contains("&zweird"));
    }

    #[test]
    fn preserves_multi_byte_utf8_text() {
        let out = colorify("&aこんにちは 👋 café&r");
        assert!(out.contains("こんにちは 👋 café"));
    }
}
