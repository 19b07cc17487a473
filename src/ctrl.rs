//! The line-oriented control interpreter.
//!
//! A control script is a batch of `add`/`set`/`setm`/`remove` lines that
//! is applied atomically: every applied line appends an inverse record to
//! an undo log, and the first failing line unwinds the log before the
//! error is reported. A script either commits completely or leaves the
//! table as it found it.

use log::warn;

use crate::table::RadixIpLookup;
use crate::types::{Route, RouteTableError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CmdKind {
    Add,
    Set,
    Remove,
}

// One applied edit, stored in the form its inverse needs: the displaced
// route for a set, the removed route for a remove, the inserted route for
// a pure add.
pub(crate) struct UndoEntry {
    kind: CmdKind,
    route: Route,
}

/// Parses and applies one command line against the table.
///
/// `args` is the line without its leading command token. When an undo log
/// is supplied the applied edit is recorded there; errors leave both the
/// table and the log untouched.
pub(crate) fn run_command(
    table: &mut RadixIpLookup,
    kind: CmdKind,
    args: &str,
    undo: Option<&mut Vec<UndoEntry>>,
) -> Result<(), RouteTableError> {
    let route = Route::parse(args, kind == CmdKind::Remove)?;
    let record = match kind {
        CmdKind::Add => {
            table.add_route(route.clone(), false)?;
            UndoEntry {
                kind: CmdKind::Add,
                route,
            }
        }
        CmdKind::Set => match table.add_route(route.clone(), true)? {
            // A set that displaced a route restores it on rollback; one
            // that displaced nothing is undone like a plain add.
            Some(old) => UndoEntry {
                kind: CmdKind::Set,
                route: old,
            },
            None => UndoEntry {
                kind: CmdKind::Add,
                route,
            },
        },
        CmdKind::Remove => {
            let old = table.remove_route(&route)?;
            UndoEntry {
                kind: CmdKind::Remove,
                route: old,
            }
        }
    };
    if let Some(undo) = undo {
        undo.push(record);
    }
    Ok(())
}

/// Applies a whole control script atomically.
///
/// Lines are executed in order; blank lines are skipped. On the first
/// error all edits applied so far are rolled back, newest first, and the
/// error is returned.
pub(crate) fn run_script(
    table: &mut RadixIpLookup,
    script: &str,
) -> Result<(), RouteTableError> {
    let mut undo: Vec<UndoEntry> = Vec::new();
    for line in script.lines() {
        let line = line.trim_start();
        let (word, args) = match line.split_once(char::is_whitespace) {
            Some((word, args)) => (word, args),
            None => (line, ""),
        };
        let kind = match word {
            "add" => CmdKind::Add,
            "set" | "setm" => CmdKind::Set,
            "remove" => CmdKind::Remove,
            "" => continue,
            other => {
                let err =
                    RouteTableError::UnknownCommand(other.to_string());
                rollback(table, &mut undo);
                return Err(err);
            }
        };
        if let Err(err) = run_command(table, kind, args, Some(&mut undo)) {
            rollback(table, &mut undo);
            return Err(err);
        }
    }
    Ok(())
}

// Unwinds the undo log, newest entry first. A failure while undoing one
// entry is reported but does not stop the rest of the rollback.
fn rollback(table: &mut RadixIpLookup, undo: &mut Vec<UndoEntry>) {
    while let Some(entry) = undo.pop() {
        let result = match entry.kind {
            CmdKind::Add => table.remove_route(&entry.route).map(|_| ()),
            CmdKind::Remove => {
                table.add_route(entry.route.clone(), false).map(|_| ())
            }
            CmdKind::Set => {
                table.add_route(entry.route.clone(), true).map(|_| ())
            }
        };
        if let Err(err) = result {
            warn!(
                "rollback of {:?} '{}' failed: {}",
                entry.kind, entry.route, err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_commits_in_order() -> Result<(), RouteTableError> {
        let mut table = RadixIpLookup::new();
        run_script(
            &mut table,
            "add 10.0.0.0/8 - 1\n\
             add 10.1.0.0/16 - 2\n\
             set 10.0.0.0/8 - 3\n\
             remove 10.1.0.0/16",
        )?;
        assert_eq!(table.route_count(), 1);
        assert_eq!(
            table.lookup_route("10.1.2.3".parse().unwrap(), 0).unwrap().port,
            3
        );
        Ok(())
    }

    #[test]
    fn blank_lines_and_setm() -> Result<(), RouteTableError> {
        let mut table = RadixIpLookup::new();
        run_script(
            &mut table,
            "\nadd 10.0.0.0/8 - 1\n\n   \nsetm 10.0.0.0/8 - 2\n",
        )?;
        assert_eq!(
            table.lookup_route("10.0.0.1".parse().unwrap(), 0).unwrap().port,
            2
        );
        Ok(())
    }

    #[test]
    fn failing_line_rolls_back_everything() -> Result<(), RouteTableError> {
        let mut table = RadixIpLookup::new();
        table.add_route("10.0.0.0/8 - 1".parse()?, false)?;
        let before = table.dump_routes();

        let err = run_script(
            &mut table,
            "add 11.0.0.0/8 - 5\n\
             add 10.0.0.0/8 - 6\n\
             remove 99.0.0.0/8",
        )
        .unwrap_err();
        assert!(matches!(err, RouteTableError::RouteExists(_)));
        assert_eq!(table.dump_routes(), before);
        Ok(())
    }

    #[test]
    fn unknown_command_rolls_back() -> Result<(), RouteTableError> {
        let mut table = RadixIpLookup::new();
        let err = run_script(
            &mut table,
            "add 10.0.0.0/8 - 1\nfrobnicate 10.0.0.0/8",
        )
        .unwrap_err();
        assert_eq!(
            err,
            RouteTableError::UnknownCommand("frobnicate".to_string())
        );
        assert_eq!(table.dump_routes(), "");
        Ok(())
    }

    #[test]
    fn rollback_restores_replaced_routes() -> Result<(), RouteTableError> {
        let mut table = RadixIpLookup::new();
        table.add_route("10.0.0.0/8 - 1 - 2".parse()?, false)?;
        let before = table.dump_routes();

        run_script(
            &mut table,
            "set 10.0.0.0/8 - 9\nremove 10.64.0.0/10",
        )
        .unwrap_err();
        assert_eq!(table.dump_routes(), before);
        assert_eq!(
            table.lookup_route("10.0.0.1".parse().unwrap(), 0).unwrap().port,
            1
        );
        Ok(())
    }

    #[test]
    fn rollback_restores_removed_routes() -> Result<(), RouteTableError> {
        let mut table = RadixIpLookup::new();
        table.add_route("10.0.0.0/8 192.168.0.1 1".parse()?, false)?;
        table.add_route("11.0.0.0/8 - 2".parse()?, false)?;
        let before = table.dump_routes();

        run_script(
            &mut table,
            "remove 10.0.0.0/8\nremove 11.0.0.0/8\nadd 11.0.0.0/8 - 3\n\
             add 11.0.0.0/8 - 4",
        )
        .unwrap_err();
        assert_eq!(table.dump_routes(), before);
        Ok(())
    }
}
