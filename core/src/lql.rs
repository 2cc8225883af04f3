//! LQL command parsing.
//!
//! Commands are whitespace-tokenised with double-quoted strings kept
//! intact. The command head is case-insensitive and table names are
//! uppercased on entry.

use crate::table::{Consistency, Record, TableMeta};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Create(TableMeta),
    Drop {
        table: String,
    },
    /// `None` describes every table.
    Describe {
        table: Option<String>,
    },
    Select {
        table: String,
        key: u16,
    },
    Insert {
        table: String,
        record: Record,
    },
    Journal,
    AddMemory {
        shard_number: u16,
        consistency: Consistency,
    },
    Run {
        path: String,
    },
    Logfile,
    Exit,
}

impl Query {
    pub fn verb(&self) -> &'static str {
        match self {
            Query::Create(_) => "CREATE",
            Query::Drop { .. } => "DROP",
            Query::Describe { .. } => "DESCRIBE",
            Query::Select { .. } => "SELECT",
            Query::Insert { .. } => "INSERT",
            Query::Journal => "JOURNAL",
            Query::AddMemory { .. } => "ADD MEMORY",
            Query::Run { .. } => "RUN",
            Query::Logfile => "LOGFILE",
            Query::Exit => "EXIT",
        }
    }
}

/// Splits a command line into tokens, honouring double quotes.
///
/// Returns `None` on an unterminated quote.
pub fn tokenize(line: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in line.chars() {
        match ch {
            '"' => {
                if in_quotes {
                    tokens.push(std::mem::take(&mut current));
                    in_quotes = false;
                } else {
                    in_quotes = true;
                }
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }

    if in_quotes {
        return None;
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Some(tokens)
}

/// Parses one LQL command line.
pub fn parse(line: &str) -> Result<Query, String> {
    let tokens = tokenize(line).ok_or_else(|| "unterminated quoted string".to_owned())?;
    if tokens.is_empty() {
        return Err("empty command".to_owned());
    }

    let head = tokens[0].to_ascii_uppercase();
    let args = &tokens[1..];

    match head.as_str() {
        "CREATE" => {
            expect_args(args, 4, "CREATE <name> <SC|SHC|EC> <partitions> <interval-ms>")?;
            let consistency = Consistency::from_token(&args[1])
                .ok_or_else(|| format!("unknown consistency '{}'", args[1]))?;
            let meta = TableMeta::new(
                args[0].to_ascii_uppercase(),
                consistency,
                parse_num::<u16>(&args[2], "partitions")?,
                parse_num::<u32>(&args[3], "compaction interval")?,
            );
            meta.validate()?;
            Ok(Query::Create(meta))
        }
        "DROP" => {
            expect_args(args, 1, "DROP <name>")?;
            Ok(Query::Drop {
                table: args[0].to_ascii_uppercase(),
            })
        }
        "DESCRIBE" => match args {
            [] => Ok(Query::Describe { table: None }),
            [name] => Ok(Query::Describe {
                table: Some(name.to_ascii_uppercase()),
            }),
            _ => Err("usage: DESCRIBE [name]".to_owned()),
        },
        "SELECT" => {
            expect_args(args, 2, "SELECT <name> <key>")?;
            Ok(Query::Select {
                table: args[0].to_ascii_uppercase(),
                key: parse_num::<u16>(&args[1], "key")?,
            })
        }
        "INSERT" => {
            if args.len() != 3 && args.len() != 4 {
                return Err("usage: INSERT <name> <key> \"<value>\" [timestamp]".to_owned());
            }
            let timestamp = match args.get(3) {
                Some(t) => parse_num::<u64>(t, "timestamp")?,
                None => 0, // stamped with the current time at execution
            };
            Ok(Query::Insert {
                table: args[0].to_ascii_uppercase(),
                record: Record::new(parse_num::<u16>(&args[1], "key")?, args[2].clone(), timestamp),
            })
        }
        "JOURNAL" => {
            expect_args(args, 0, "JOURNAL")?;
            Ok(Query::Journal)
        }
        "ADD" => {
            // ADD MEMORY <number> TO <SC|SHC|EC>
            if args.len() != 4
                || !args[0].eq_ignore_ascii_case("MEMORY")
                || !args[2].eq_ignore_ascii_case("TO")
            {
                return Err("usage: ADD MEMORY <number> TO <SC|SHC|EC>".to_owned());
            }
            let consistency = Consistency::from_token(&args[3])
                .ok_or_else(|| format!("unknown consistency '{}'", args[3]))?;
            Ok(Query::AddMemory {
                shard_number: parse_num::<u16>(&args[1], "shard number")?,
                consistency,
            })
        }
        "RUN" => {
            expect_args(args, 1, "RUN <path>")?;
            Ok(Query::Run {
                path: args[0].clone(),
            })
        }
        "LOGFILE" => {
            expect_args(args, 0, "LOGFILE")?;
            Ok(Query::Logfile)
        }
        "EXIT" => {
            expect_args(args, 0, "EXIT")?;
            Ok(Query::Exit)
        }
        other => Err(format!("unknown command '{other}'")),
    }
}

fn expect_args(args: &[String], count: usize, usage: &str) -> Result<(), String> {
    if args.len() != count {
        return Err(format!("usage: {usage}"));
    }
    Ok(())
}

fn parse_num<T: std::str::FromStr>(token: &str, what: &str) -> Result<T, String> {
    token
        .parse::<T>()
        .map_err(|_| format!("invalid {what} '{token}'"))
}
