//! Named-parameter query compiler.
//!
//! Rewrites `:name` placeholders into PostgreSQL's positional `$N` form
//! and lays out the coerced arguments in matching order.
//!
//! ```text
//! SELECT * FROM users WHERE org = :org AND id = :id
//!                                   │          │
//! Params { id: 7, org: 3 }          │          │
//!          ─┬─    ──┬──             ▼          ▼
//!           $1      $2      SELECT * FROM users WHERE org = $2 AND id = $1
//! ```
//!
//! The position of a key in the parameter set decides its index, not the
//! order its placeholder appears in the text. A placeholder only matches
//! when the name is not immediately followed by another identifier
//! character, so `:id` never rewrites part of `:id2`. Cast hints such as
//! `:payload::jsonb` are left intact.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::char,
    combinator::{all_consuming, map},
    multi::many0,
    sequence::preceded,
    IResult,
};
use std::fmt::Write;

use crate::coerce::{coerce, DriverValue};
use crate::error::{FastpgError, FastpgResult};
use crate::value::Params;

/// A query with positional placeholders and one argument list.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub args: Vec<DriverValue>,
}

/// A query with positional placeholders and one argument list per execution.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledBatch {
    pub sql: String,
    pub args: Vec<Vec<DriverValue>>,
}

/// One piece of query text.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Segment<'q> {
    Text(&'q str),
    /// Placeholder name without the leading colon.
    Placeholder(&'q str),
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Parse `:name`, taking the longest run of identifier characters.
fn parse_placeholder(input: &str) -> IResult<&str, Segment<'_>> {
    map(
        preceded(char(':'), take_while1(is_ident_char)),
        Segment::Placeholder,
    )(input)
}

/// Parse literal text up to the next colon, or a colon that starts no placeholder.
fn parse_text(input: &str) -> IResult<&str, Segment<'_>> {
    map(alt((take_while1(|c: char| c != ':'), tag(":"))), Segment::Text)(input)
}

fn segments(query: &str) -> Vec<Segment<'_>> {
    match all_consuming(many0(alt((parse_placeholder, parse_text))))(query) {
        Ok((_, segments)) => segments,
        // Every character is accepted by `parse_text`; keep the text verbatim regardless.
        Err(_) => vec![Segment::Text(query)],
    }
}

/// Replace every bound `:name` with `$N`, N being the key's 1-based position.
fn substitute(query: &str, params: &Params) -> String {
    let mut sql = String::with_capacity(query.len());
    for segment in segments(query) {
        match segment {
            Segment::Text(text) => sql.push_str(text),
            Segment::Placeholder(name) => match params.position(name) {
                Some(index) => {
                    let _ = write!(sql, "${}", index + 1);
                }
                None => {
                    sql.push(':');
                    sql.push_str(name);
                }
            },
        }
    }
    sql
}

/// Compile a query for a single execution.
///
/// Without values the query is returned unchanged. Keys never referenced
/// in the text still take a position and are still bound.
pub fn compile_query(query: &str, values: Option<&Params>) -> CompiledQuery {
    let Some(params) = values else {
        return CompiledQuery {
            sql: query.to_string(),
            args: Vec::new(),
        };
    };

    let compiled = CompiledQuery {
        sql: substitute(query, params),
        args: params.values().map(coerce).collect(),
    };
    tracing::trace!(sql = %compiled.sql, args = compiled.args.len(), "compiled query");
    compiled
}

/// Compile a query for batch execution.
///
/// The first value set fixes both the placeholder indexes and the
/// canonical key order; every later set is projected onto that order.
/// Keys a later set has beyond the canonical ones are ignored.
pub fn compile_many(query: &str, values: &[Params]) -> FastpgResult<CompiledBatch> {
    let (first, rest) = values.split_first().ok_or(FastpgError::EmptyBatch)?;

    let mut args = Vec::with_capacity(values.len());
    args.push(first.values().map(coerce).collect());

    for (offset, set) in rest.iter().enumerate() {
        let row = first
            .keys()
            .map(|key| {
                set.get(key)
                    .map(coerce)
                    .ok_or_else(|| FastpgError::MissingKey {
                        key: key.to_string(),
                        index: offset + 1,
                    })
            })
            .collect::<FastpgResult<Vec<_>>>()?;
        args.push(row);
    }

    let compiled = CompiledBatch {
        sql: substitute(query, first),
        args,
    };
    tracing::trace!(sql = %compiled.sql, rows = compiled.args.len(), "compiled batch");
    Ok(compiled)
}
