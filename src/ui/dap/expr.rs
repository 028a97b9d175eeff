//! Hover expression parser.
//!
//! Two forms are accepted: `stack[<signed index>]` (negative indices count
//! from the top of the stack) and `scratch[<index>]`.

use nom::branch::alt;
use nom::character::complete::{digit1, multispace0};
use nom::combinator::{map, map_res, opt, recognize};
use nom::sequence::{delimited, pair, preceded};
use nom::IResult;
use nom_supreme::error::ErrorTree;
use nom_supreme::final_parser::{final_parser, Location};
use nom_supreme::tag::complete::tag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoverExpr {
    Stack(i64),
    Scratch(i64),
}

fn signed_int(i: &str) -> IResult<&str, i64, ErrorTree<&str>> {
    map_res(recognize(pair(opt(tag("-")), digit1)), str::parse)(i)
}

fn index(i: &str) -> IResult<&str, i64, ErrorTree<&str>> {
    delimited(
        pair(multispace0, tag("[")),
        delimited(multispace0, signed_int, multispace0),
        pair(tag("]"), multispace0),
    )(i)
}

fn expr(i: &str) -> IResult<&str, HoverExpr, ErrorTree<&str>> {
    preceded(
        multispace0,
        alt((
            map(preceded(tag("stack"), index), HoverExpr::Stack),
            map(preceded(tag("scratch"), index), HoverExpr::Scratch),
        )),
    )(i)
}

/// Parser for a complete hover expression.
pub fn parse(input: &str) -> Result<HoverExpr, ErrorTree<Location>> {
    final_parser::<_, _, _, ErrorTree<Location>>(expr)(input)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_hover_expr_parsing() {
        struct TestCase {
            string: &'static str,
            expr: HoverExpr,
        }
        let test_cases = vec![
            TestCase { string: "stack[0]", expr: HoverExpr::Stack(0) },
            TestCase { string: "stack[-1]", expr: HoverExpr::Stack(-1) },
            TestCase { string: " stack[ 12 ] ", expr: HoverExpr::Stack(12) },
            TestCase { string: "scratch[255]", expr: HoverExpr::Scratch(255) },
            TestCase { string: "scratch[1000]", expr: HoverExpr::Scratch(1000) },
        ];
        for tc in test_cases {
            assert_eq!(parse(tc.string).unwrap(), tc.expr, "{}", tc.string);
        }
    }

    #[test]
    fn test_rejects_garbage() {
        for input in ["", "stack", "stack[]", "stack[1", "heap[0]", "stack[0] extra"] {
            assert!(parse(input).is_err(), "{input}");
        }
    }
}
