//! Rendering an argv vector the way a user would type it into bash,
//! for log messages and error context only -- never used to actually
//! build a shell command line.

use std::borrow::Cow;

fn quote_one(s: &str) -> Cow<str> {
    if !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:,@%+".contains(&b))
    {
        Cow::Borrowed(s)
    } else {
        Cow::Owned(format!("'{}'", s.replace('\'', "'\\''")))
    }
}

pub fn cmd_as_bash_string<'s>(argv: impl IntoIterator<Item = Cow<'s, str>>) -> String {
    argv.into_iter()
        .map(|s| quote_one(&s).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_quote() {
        assert_eq!(
            cmd_as_bash_string(vec![Cow::Borrowed("echo"), Cow::Borrowed("a b")]),
            "echo 'a b'"
        );
        assert_eq!(
            cmd_as_bash_string(vec![Cow::Borrowed("foo"), Cow::Borrowed("bar.c")]),
            "foo bar.c"
        );
    }
}
