// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Template documents shared by the integration suites.

/// Orders and items.
///
/// * `order.note`: free text, merged by `longest`.
/// * `order.total`: `sum` of `item.qty` over `part_of`.
/// * `has_items`: every order needs exactly one item (`required`, `singular`).
/// * `item.qty`: int, defaults to 0, never negative.
pub const ORDER_TEMPLATE: &str = r#"{
    "version": 1,
    "rectypes": {
        "order": { "fields": {
            "note": { "datatype": "string", "merge": { "auto": [ { "op": "longest" } ] } },
            "total": { "datatype": "int",
                "calculated": { "builtin": "sum", "field_from": "qty", "depends_on": "part_of" } }
        } },
        "item": { "fields": {
            "qty": { "datatype": "int", "constraints": { "defaultvalue": 0, "min": 0 } }
        } }
    },
    "directed_linktypes": {
        "has_items": {
            "from": { "link_rectypes": ["order"], "required": true, "singular": true },
            "to": { "link_rectypes": ["item"] }
        },
        "part_of": {
            "from": { "link_rectypes": ["item"] },
            "to": { "link_rectypes": ["order"] }
        }
    }
}"#;

/// A `counter` whose `count` merges by `max` and whose `label` has no policy.
pub const COUNTER_TEMPLATE: &str = r#"{
    "rectypes": {
        "counter": { "fields": {
            "count": { "datatype": "int", "constraints": { "defaultvalue": 0 },
                "merge": { "auto": [ { "op": "max" } ] } },
            "label": { "datatype": "string" }
        } }
    }
}"#;

/// A `user` whose `handle` is generated, unique, and repaired by
/// `inc_digits_end` when a merge makes two users share it.
pub const HANDLE_TEMPLATE: &str = r#"{
    "rectypes": {
        "user": { "fields": {
            "handle": { "datatype": "string",
                "constraints": { "required": true, "unique": true,
                    "defaultfunc": { "name": "gen_random_unique", "length": 6 } },
                "merge": { "uniqify": { "which": "last_created", "op": "inc_digits_end" } } },
            "created": { "datatype": "datetime", "constraints": { "defaultvalue": "now" } },
            "owner": { "datatype": "userid", "constraints": { "defaultvalue": "whoami" } }
        } }
    }
}"#;

/// Like [`HANDLE_TEMPLATE`] without a repair policy.
pub const STRICT_HANDLE_TEMPLATE: &str = r#"{
    "rectypes": {
        "user": { "fields": {
            "handle": { "datatype": "string", "constraints": { "unique": true } }
        } }
    }
}"#;

/// Tree of nodes where a parent has at most one `primary` child.
pub const TREE_TEMPLATE: &str = r#"{
    "rectypes": {
        "node": { "fields": { "name": { "datatype": "string" } } }
    },
    "directed_linktypes": {
        "primary": {
            "from": { "link_rectypes": ["node"], "singular": true },
            "to": { "link_rectypes": ["node"] }
        }
    }
}"#;

/// [`COUNTER_TEMPLATE`] plus a free-text `note`.
pub const COUNTER_NOTE_TEMPLATE: &str = r#"{
    "rectypes": {
        "counter": { "fields": {
            "count": { "datatype": "int", "constraints": { "defaultvalue": 0 },
                "merge": { "auto": [ { "op": "max" } ] } },
            "label": { "datatype": "string" },
            "note": { "datatype": "string" }
        } }
    }
}"#;

/// [`COUNTER_TEMPLATE`] plus a boolean `flagged`.
pub const COUNTER_FLAG_TEMPLATE: &str = r#"{
    "rectypes": {
        "counter": { "fields": {
            "count": { "datatype": "int", "constraints": { "defaultvalue": 0 },
                "merge": { "auto": [ { "op": "max" } ] } },
            "label": { "datatype": "string" },
            "flagged": { "datatype": "bool" }
        } }
    }
}"#;

/// Ledger entries merged as a whole: divergent edits always conflict.
pub const LEDGER_TEMPLATE: &str = r#"{
    "rectypes": {
        "entry": { "merge_type": "record", "fields": {
            "amount": { "datatype": "int" },
            "memo": { "datatype": "string" }
        } }
    }
}"#;

/// A `doc` whose `title` keeps the newest edit and `summary` the oldest.
pub const DOC_TEMPLATE: &str = r#"{
    "rectypes": {
        "doc": { "fields": {
            "title": { "datatype": "string", "merge": { "auto": [ { "op": "most_recent" } ] } },
            "summary": { "datatype": "string", "merge": { "auto": [ { "op": "least_recent" } ] } }
        } }
    }
}"#;

/// An `acct` whose unique `num` is repaired by adding 10, disturbing the
/// record with the fewest editors.
pub const ACCOUNT_TEMPLATE: &str = r#"{
    "rectypes": {
        "acct": { "fields": {
            "num": { "datatype": "int", "constraints": { "unique": true },
                "merge": { "uniqify": { "which": "least_impact", "op": "add", "addend": 10 } } }
        } }
    }
}"#;

/// A `ticket` whose unique `code` is regenerated on the most recently
/// modified record and whose unique `slug` gets the merging user's prefix on
/// the most recently created one.
pub const TICKET_TEMPLATE: &str = r#"{
    "rectypes": {
        "ticket": { "fields": {
            "code": { "datatype": "string", "constraints": { "unique": true },
                "merge": { "uniqify": { "which": "last_modified", "op": "gen_random_unique",
                    "length": 8, "alphabet": "abcdef" } } },
            "slug": { "datatype": "string", "constraints": { "unique": true },
                "merge": { "uniqify": { "which": "last_created", "op": "gen_userprefix_unique",
                    "length": 4 } } }
        } }
    }
}"#;
