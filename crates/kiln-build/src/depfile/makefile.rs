//! Make-style dependency output: `<target>: <prereq> <prereq> ...` with
//! backslash-newline continuations.

use anyhow::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MakefileDeps {
    pub target: String,
    pub prereqs: Vec<String>,
}

/// Parse with the host's path-separator convention.
pub fn parse(text: &str) -> Result<MakefileDeps> {
    parse_with_mode(text, cfg!(windows))
}

/// `backslash_is_separator` selects the Windows reading of `\`: a `\\` pair
/// is kept literally wherever it appears, `\` before a space escapes the
/// space, and any other `\` is an ordinary path character. In the POSIX
/// reading `\` escapes the following character.
pub fn parse_with_mode(text: &str, backslash_is_separator: bool) -> Result<MakefileDeps> {
    let mut scan = Scanner {
        bytes: text.as_bytes(),
        pos: 0,
        at_line_start: true,
        saw_colon: false,
        backslash_is_separator,
    };

    let target = scan
        .next_token(true)?
        .ok_or_else(|| anyhow::anyhow!("dependency file has no target line"))?;
    if !scan.saw_colon {
        anyhow::bail!("dependency file target {:?} is not followed by ':'", target);
    }

    let mut prereqs = Vec::new();
    while let Some(tok) = scan.next_token(false)? {
        prereqs.push(tok);
    }
    Ok(MakefileDeps { target, prereqs })
}

struct Scanner<'a> {
    bytes: &'a [u8],
    pos: usize,
    at_line_start: bool,
    saw_colon: bool,
    backslash_is_separator: bool,
}

impl Scanner<'_> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        self.at_line_start = b == b'\n';
        Some(b)
    }

    fn skip_separators(&mut self) {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') => {
                    self.bump();
                }
                Some(b'#') if self.at_line_start => {
                    while let Some(b) = self.bump() {
                        if b == b'\n' {
                            break;
                        }
                    }
                }
                Some(b'\\') => {
                    // Backslash-newline is a continuation and otherwise
                    // starts a token.
                    match self.bytes.get(self.pos + 1) {
                        Some(b'\n') => {
                            self.pos += 2;
                            self.at_line_start = true;
                        }
                        Some(b'\r') if self.bytes.get(self.pos + 2) == Some(&b'\n') => {
                            self.pos += 3;
                            self.at_line_start = true;
                        }
                        _ => return,
                    }
                }
                _ => return,
            }
        }
    }

    /// Lex one token. In target position (`stop_at_colon`) the token also
    /// ends at the first colon, except the colon of a drive letter like
    /// `c:\` in separator mode.
    fn next_token(&mut self, stop_at_colon: bool) -> Result<Option<String>> {
        self.saw_colon = false;
        self.skip_separators();
        if self.peek().is_none() {
            return Ok(None);
        }
        let mut tok: Vec<u8> = Vec::new();
        while let Some(b) = self.peek() {
            match b {
                b' ' | b'\t' | b'\r' | b'\n' => break,
                b':' if stop_at_colon => {
                    let drive_colon = self.backslash_is_separator
                        && tok.len() == 1
                        && tok[0].is_ascii_alphabetic()
                        && matches!(self.bytes.get(self.pos + 1), Some(b'\\') | Some(b'/'));
                    if drive_colon {
                        tok.push(b':');
                        self.bump();
                    } else {
                        self.bump();
                        self.saw_colon = true;
                        break;
                    }
                }
                b'\\' => {
                    let next = self.bytes.get(self.pos + 1).copied();
                    match next {
                        Some(b'\n') => break,
                        Some(b'\r') if self.bytes.get(self.pos + 2) == Some(&b'\n') => break,
                        Some(b' ') => {
                            tok.push(b' ');
                            self.pos += 2;
                        }
                        Some(b'\\') if self.backslash_is_separator => {
                            tok.extend_from_slice(b"\\\\");
                            self.pos += 2;
                        }
                        Some(c) if !self.backslash_is_separator => {
                            tok.push(c);
                            self.pos += 2;
                        }
                        _ => {
                            tok.push(b'\\');
                            self.bump();
                        }
                    }
                }
                _ => {
                    tok.push(b);
                    self.bump();
                }
            }
        }
        if tok.is_empty() {
            // Lone colon or stray escape; treat as malformed input.
            anyhow::bail!("empty token at byte {} of dependency file", self.pos);
        }
        Ok(Some(String::from_utf8_lossy(&tok).into_owned()))
    }
}
