//! Ordered record of committed multi-part edits with compensating actions.
//!
//! Chart creation, copying and updating each touch several files. Each step snapshots the parts
//! it is about to change; if the operation returns early with an error, dropping the journal
//! restores every snapshot in reverse order, so the working tree is left as it was before the
//! operation started.

use std::collections::HashSet;

use crate::docx::session::PackageSession;
use crate::error::Result;

enum Undo {
    Remove(String),
    Restore(String, Vec<u8>),
}

pub struct Journal<'s> {
    session: &'s PackageSession,
    operation: String,
    steps: Vec<String>,
    undo: Vec<Undo>,
    snapshotted: HashSet<String>,
    committed: bool,
}

impl<'s> Journal<'s> {
    pub fn new(session: &'s PackageSession, operation: impl Into<String>) -> Self {
        Self {
            session,
            operation: operation.into(),
            steps: Vec::new(),
            undo: Vec::new(),
            snapshotted: HashSet::new(),
            committed: false,
        }
    }

    fn snapshot(&mut self, part: &str) -> Result<()> {
        if !self.snapshotted.insert(part.to_string()) {
            return Ok(());
        }
        let undo = if self.session.part_exists(part)? {
            Undo::Restore(part.to_string(), self.session.read_part(part)?)
        } else {
            Undo::Remove(part.to_string())
        };
        self.undo.push(undo);
        Ok(())
    }

    /// Writes one part as a named step.
    pub fn write(&mut self, step: &str, part: &str, data: &[u8]) -> Result<()> {
        self.snapshot(part)?;
        self.session.write_part(part, data)?;
        self.record(step);
        Ok(())
    }

    /// Runs `f` as a named step that may modify any of `parts`.
    pub fn step<T>(
        &mut self,
        step: &str,
        parts: &[&str],
        f: impl FnOnce(&PackageSession) -> Result<T>,
    ) -> Result<T> {
        for part in parts {
            self.snapshot(part)?;
        }
        let out = f(self.session)?;
        self.record(step);
        Ok(out)
    }

    fn record(&mut self, step: &str) {
        log::debug!("{}: {step}", self.operation);
        self.steps.push(step.to_string());
    }

    /// Keeps every write and returns the step names in commit order.
    pub fn commit(mut self) -> Vec<String> {
        self.committed = true;
        std::mem::take(&mut self.steps)
    }

    fn roll_back(&mut self) {
        if self.undo.is_empty() {
            return;
        }
        log::warn!(
            "{}: rolling back {} step(s) after failure",
            self.operation,
            self.steps.len()
        );
        while let Some(undo) = self.undo.pop() {
            let res = match &undo {
                Undo::Remove(part) => self.session.remove_part(part),
                Undo::Restore(part, data) => self.session.write_part(part, data),
            };
            if let Err(e) = res {
                log::warn!("{}: rollback step failed: {e}", self.operation);
            }
        }
    }
}

impl Drop for Journal<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.roll_back();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docx::session::StagingOptions;
    use crate::error::PatchError;

    #[test]
    fn dropped_journal_restores_and_removes() {
        let session = PackageSession::create_blank(&StagingOptions::default()).expect("blank");
        let original = session.read_part("word/document.xml").expect("read");

        let res: Result<()> = (|| {
            let mut journal = Journal::new(&session, "test");
            journal.write("new part", "word/new.xml", b"<x/>")?;
            journal.write("edit document", "word/document.xml", b"<changed/>")?;
            journal.write("edit again", "word/document.xml", b"<changed twice/>")?;
            journal.step::<()>("fail", &["word/other.xml"], |_| {
                Err(PatchError::Validation("boom".into()))
            })?;
            journal.commit();
            Ok(())
        })();

        assert!(res.is_err());
        assert!(!session.part_exists("word/new.xml").expect("exists"));
        assert_eq!(session.read_part("word/document.xml").expect("read"), original);
    }

    #[test]
    fn committed_journal_keeps_writes() {
        let session = PackageSession::create_blank(&StagingOptions::default()).expect("blank");
        let mut journal = Journal::new(&session, "test");
        journal.write("a", "word/a.xml", b"<a/>").expect("write");
        journal
            .step("b", &["word/b.xml"], |s| s.write_part("word/b.xml", b"<b/>"))
            .expect("step");
        assert_eq!(journal.commit(), vec!["a", "b"]);
        assert!(session.part_exists("word/a.xml").expect("a"));
        assert!(session.part_exists("word/b.xml").expect("b"));
    }
}
