// fuzz_targets/lexer.rs
#![no_main]

use libfuzzer_sys::fuzz_target;
use tela::fs::Format;
use tela::lexer::{lex, Mode, Tok};

fuzz_target!(|data: &[u8]| {
    let s = String::from_utf8_lossy(data);

    for mode in [
        Mode::Template(Format::Html),
        Mode::Template(Format::Text),
        Mode::Template(Format::Css),
        Mode::Script,
    ] {
        let toks = match lex(&s, mode) {
            Ok(toks) => toks,
            Err(_) => continue,
        };

        let mut last_start = 0u32;
        for t in &toks {
            assert!(t.pos.start <= t.pos.end + 1);
            assert!((t.pos.end as usize) <= s.len().max(1));
            // Tokens never move backwards.
            assert!(t.pos.start >= last_start);
            last_start = t.pos.start;
        }
        assert_eq!(toks.last().map(|t| t.tok), Some(Tok::Eof));
    }
});
