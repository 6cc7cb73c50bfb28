//! Expansion of Slurm hostlist notation, e.g. `node[01-03,07]` or `cpu[1-2],gpu07`.
use regex::Regex;

use crate::*;

fn node_list_error(list: &str, reason: &'static str) -> ParseError {
    ParseError::NodeList {
        list: list.to_string(),
        reason,
    }
}

/// Split a node list into its top-level groups, ignoring commas inside brackets.
fn split_groups(list: &str) -> ParseResult<Vec<&str>> {
    let mut groups = vec![];
    let mut depth = 0usize;
    let mut begin = 0;
    for (k, c) in list.char_indices() {
        match c {
            '[' => {
                if depth > 0 {
                    return Err(node_list_error(list, "nested brackets"));
                }
                depth += 1;
            }
            ']' => {
                if depth == 0 {
                    return Err(node_list_error(list, "unmatched ']'"));
                }
                depth -= 1;
            }
            ',' if depth == 0 => {
                groups.push(&list[begin..k]);
                begin = k + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(node_list_error(list, "missing ']'"));
    }
    groups.push(&list[begin..]);
    Ok(groups)
}

fn expand_group(list: &str, group: &str, dest: &mut Vec<String>) -> ParseResult<()> {
    lazy_static::lazy_static! {
        static ref INDEX_RANGE: Regex = Regex::new(r"^(?P<lo>\d+)(-(?P<hi>\d+))?$").unwrap();
    }

    let (stem, rest) = match group.split_once('[') {
        None => {
            dest.push(group.to_string());
            return Ok(());
        }
        Some(x) => x,
    };
    let (body, suffix) = rest
        .split_once(']')
        .ok_or_else(|| node_list_error(list, "missing ']'"))?;

    for token in body.split(',') {
        let captures = INDEX_RANGE
            .captures(token.trim())
            .ok_or_else(|| node_list_error(list, "invalid index in brackets"))?;
        let lo_digits = &captures["lo"];
        let width = lo_digits.len();
        let lo = parse_uint(lo_digits).map_err(|_| node_list_error(list, "index out of range"))?;
        let hi = match captures.name("hi") {
            Some(hi) => {
                parse_uint(hi.as_str()).map_err(|_| node_list_error(list, "index out of range"))?
            }
            None => lo,
        };
        if lo > hi {
            return Err(node_list_error(list, "range bounds are reversed"));
        }
        dest.extend((lo..=hi).map(|i| format!("{}{:0width$}{}", stem, i, suffix, width = width)));
    }
    Ok(())
}

/// Expand a node list into hostnames, in the order written.
///
/// Every index is printed with the digit count of the low bound of its own bracket token, so
/// `n[08-10,7]` gives `n08, n09, n10, n7`.  A list without brackets is returned as-is.
pub fn expand_nodelist(list: &str) -> ParseResult<Vec<String>> {
    let mut nodes = vec![];
    for group in split_groups(list)? {
        expand_group(list, group, &mut nodes)?;
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expand(s: &str) -> Vec<String> {
        expand_nodelist(s).unwrap()
    }

    #[test]
    fn literal() {
        assert_eq!(expand("node07"), ["node07"]);
        assert_eq!(expand("None assigned"), ["None assigned"]);
        assert_eq!(expand(""), [""]);
    }

    #[test]
    fn ranges() {
        assert_eq!(
            expand("node[06-08,13]"),
            ["node06", "node07", "node08", "node13"]
        );
        assert_eq!(
            expand("node[01-03,07,10-12]"),
            ["node01", "node02", "node03", "node07", "node10", "node11", "node12"]
        );
        assert_eq!(expand("c[8-11]"), ["c8", "c9", "c10", "c11"]);
        assert_eq!(expand("gpu[001-002]"), ["gpu001", "gpu002"]);
        assert_eq!(expand("rack[5]"), ["rack5"]);
    }

    #[test]
    fn order_and_duplicates_preserved() {
        assert_eq!(expand("n[3,1,3]"), ["n3", "n1", "n3"]);
    }

    #[test]
    fn multiple_groups_and_suffix() {
        assert_eq!(
            expand("cpu[1-2],gpu07,ib[01-02]-eth"),
            ["cpu1", "cpu2", "gpu07", "ib01-eth", "ib02-eth"]
        );
    }

    #[test]
    fn malformed() {
        assert!(matches!(
            expand_nodelist("node[08-06]"),
            Err(ParseError::NodeList { reason: "range bounds are reversed", .. })
        ));
        assert!(expand_nodelist("node[01-03").is_err());
        assert!(expand_nodelist("node01]").is_err());
        assert!(expand_nodelist("node[a-b]").is_err());
        assert!(expand_nodelist("node[]").is_err());
        assert!(expand_nodelist("node[1-]").is_err());
    }
}
