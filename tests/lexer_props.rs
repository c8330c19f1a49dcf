// Property tests for the context-aware lexer.

use proptest::prelude::*;
use tela::error::Position;
use tela::fs::Format;
use tela::lexer::{lex, Mode, Tok};

fn positions_are_sane(src: &str, toks: &[tela::lexer::Token]) {
    let mut last_start = 0u32;
    for t in toks {
        let Position { start, end, line, column } = t.pos;
        assert!(line >= 1 && column >= 1, "bad line/col in {src:?}");
        assert!(start as usize <= src.len(), "start out of bounds in {src:?}");
        assert!(end as usize <= src.len().max(1), "end out of bounds in {src:?}");
        assert!(start >= last_start, "token moved backwards in {src:?}");
        last_start = start;
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        .. ProptestConfig::default()
    })]

    #[test]
    fn never_panics_on_arbitrary_input(s in ".*") {
        for format in [Format::Text, Format::Html, Format::Css, Format::JavaScript] {
            if let Ok(toks) = lex(&s, Mode::Template(format)) {
                prop_assert!(!toks.is_empty());
                prop_assert_eq!(toks.last().map(|t| t.tok), Some(Tok::Eof));
                positions_are_sane(&s, &toks);
            }
        }
        let _ = lex(&s, Mode::Script);
    }

    #[test]
    fn plain_text_is_one_token(s in "[a-zA-Z0-9 .,!\n-]*") {
        let toks = lex(&s, Mode::Template(Format::Text)).unwrap();
        if s.is_empty() {
            prop_assert_eq!(toks.len(), 1); // EOF only
        } else {
            prop_assert_eq!(toks.len(), 2);
            prop_assert_eq!(toks[0].tok, Tok::Text);
        }
    }

    #[test]
    fn shown_identifier_round_trips(name in "[a-z][a-z0-9_]{0,10}") {
        let src = format!("x{{{{ {name} }}}}y");
        let toks = lex(&src, Mode::Template(Format::Html)).unwrap();
        let kinds: Vec<Tok> = toks.iter().map(|t| t.tok).collect();
        prop_assert_eq!(
            kinds,
            vec![
                Tok::Text,
                Tok::StartValue,
                Tok::Ident,
                Tok::EndValue,
                Tok::Text,
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn script_numbers_lex(n in 0u64..1_000_000_000) {
        let src = format!("x := {n}");
        let toks = lex(&src, Mode::Script).unwrap();
        prop_assert!(toks.iter().any(|t| t.tok == Tok::Int));
    }
}

#[test]
fn code_token_positions_are_byte_precise() {
    let toks = lex("{{a.b}}", Mode::Template(Format::Html)).unwrap();
    let spans: Vec<(u32, u32)> = toks
        .iter()
        .filter(|t| t.tok != Tok::Eof)
        .map(|t| (t.pos.start, t.pos.end))
        .collect();
    assert_eq!(spans, vec![(0, 1), (2, 2), (3, 3), (4, 4), (5, 6)]);
}
