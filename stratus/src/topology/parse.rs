//! parsers for the compact instance template syntax:
//! `"1 hadoop-namenode+hadoop-jobtracker,3 hadoop-datanode+hadoop-tasktracker"`
//!
//! the same `<number> <role-set>` list is used for the template counts, the
//! minimum success percentages and the minimum instance counts.

use nom::bytes::complete::take_while1;
use nom::character::complete::{char, multispace0, multispace1, u32 as number};
use nom::combinator::{all_consuming, map};
use nom::multi::separated_list1;
use nom::sequence::{delimited, separated_pair};
use nom::{Finish, IResult};
use crate::err::ConfigErr;
use crate::topology::RoleSet;

fn is_role_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'
}

pub fn role_name(i: &str) -> IResult<&str, &str> {
    take_while1(is_role_char)(i)
}

pub fn role_set(i: &str) -> IResult<&str, RoleSet> {
    map(separated_list1(char('+'), role_name), |roles| {
        RoleSet::new(roles)
    })(i)
}

fn counted_role_set(i: &str) -> IResult<&str, (u32, RoleSet)> {
    delimited(
        multispace0,
        separated_pair(number, multispace1, role_set),
        multispace0,
    )(i)
}

fn counted_role_sets(i: &str) -> IResult<&str, Vec<(u32, RoleSet)>> {
    separated_list1(char(','), counted_role_set)(i)
}

/// parse a comma separated list of `<number> role1+role2` entries
pub fn counted(s: &str) -> Result<Vec<(u32, RoleSet)>, ConfigErr> {
    if s.trim().is_empty() {
        return Err(ConfigErr::template(s, "at least one entry is required"));
    }
    all_consuming(counted_role_sets)(s)
        .finish()
        .map(|(_, entries)| entries)
        .map_err(|err| {
            ConfigErr::template(s, format!("unexpected input at '{}'", err.input))
        })
}

/// parse a single `role1+role2` string
pub fn roles(s: &str) -> Result<RoleSet, ConfigErr> {
    all_consuming(delimited(multispace0, role_set, multispace0))(s)
        .finish()
        .map(|(_, roles)| roles)
        .map_err(|err| ConfigErr::template(s, format!("illegal role name at '{}'", err.input)))
}
