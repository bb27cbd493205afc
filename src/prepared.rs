use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::hash::{BuildHasher, Hash};

use auto_impl::auto_impl;

use crate::error::{Error, Result};
use crate::protocol::command::FieldDescriptor;
use crate::sync::{ResultCursor, Session};
use crate::value::Value;

/// Values bound to a prepared statement's named parameters.
#[auto_impl(&, Box)]
pub trait Params {
    /// Value for the parameter called `name`, or `None` if it was not bound
    fn value(&self, name: &str) -> Option<&Value>;
}

impl<S, H> Params for HashMap<S, Value, H>
where
    S: Borrow<str> + Hash + Eq,
    H: BuildHasher,
{
    fn value(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

impl<S: Borrow<str> + Ord> Params for BTreeMap<S, Value> {
    fn value(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

impl<S: AsRef<str>> Params for [(S, Value)] {
    fn value(&self, name: &str) -> Option<&Value> {
        self.iter()
            .find(|(key, _)| key.as_ref() == name)
            .map(|(_, value)| value)
    }
}

impl<S: AsRef<str>> Params for Vec<(S, Value)> {
    fn value(&self, name: &str) -> Option<&Value> {
        self.as_slice().value(name)
    }
}

impl<S: AsRef<str>, const N: usize> Params for [(S, Value); N] {
    fn value(&self, name: &str) -> Option<&Value> {
        self.as_slice().value(name)
    }
}

/// A server-side prepared statement.
///
/// A statement remembers which session and session generation prepared it.
/// Executing it on another session, after a [`Session::reset`], or after
/// [`PreparedStatement::set_sql`] prepares it again first.
#[derive(Debug)]
pub struct PreparedStatement {
    sql: String,
    param_names: Vec<String>,
    statement_id: u32,
    params: Vec<FieldDescriptor>,
    execution_count: u64,
    /// (session id, generation) the statement id belongs to
    owner: (u64, u64),
    stale: bool,
}

impl PreparedStatement {
    pub(crate) fn new(
        sql: String,
        param_names: Vec<String>,
        statement_id: u32,
        params: Vec<FieldDescriptor>,
        session: &Session,
    ) -> Self {
        Self {
            sql,
            param_names,
            statement_id,
            params,
            execution_count: 0,
            owner: (session.id(), session.generation()),
            stale: false,
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    pub fn statement_id(&self) -> u32 {
        self.statement_id
    }

    /// Parameter descriptors, named after `param_names`
    pub fn params(&self) -> &[FieldDescriptor] {
        &self.params
    }

    /// Number of successful executions
    pub fn execution_count(&self) -> u64 {
        self.execution_count
    }

    /// Replace the statement text. The next execute prepares it again.
    pub fn set_sql(&mut self, sql: impl Into<String>, param_names: &[&str]) {
        let sql = sql.into();
        let names: Vec<String> = param_names.iter().map(ToString::to_string).collect();
        if sql != self.sql || names != self.param_names {
            self.sql = sql;
            self.param_names = names;
            self.stale = true;
        }
    }

    fn owned_by(&self, session: &Session) -> bool {
        self.owner == (session.id(), session.generation())
    }

    /// Bind `params` by name and execute.
    ///
    /// Every named parameter must be bound; [`Error::MissingParameter`] is returned
    /// before anything is sent otherwise.
    pub fn execute<'s, P: Params + ?Sized>(
        &mut self,
        session: &'s mut Session,
        params: &P,
    ) -> Result<ResultCursor<'s>> {
        let values = self
            .param_names
            .iter()
            .map(|name| params.value(name).ok_or_else(|| Error::MissingParameter(name.clone())))
            .collect::<Result<Vec<&Value>>>()?;

        if self.stale || !self.owned_by(session) {
            self.reprepare(session)?;
        }

        let cursor = session.execute_statement(self.statement_id, &values)?;
        self.execution_count += 1;
        Ok(cursor)
    }

    fn reprepare(&mut self, session: &mut Session) -> Result<()> {
        tracing::debug!(sql = %self.sql, stale = self.stale, "re-preparing statement");
        if self.stale && self.owned_by(session) {
            session.close_statement(self.statement_id)?;
        }
        let (statement_id, params) = session.prepare_statement(&self.sql, &self.param_names)?;
        self.statement_id = statement_id;
        self.params = params;
        self.owner = (session.id(), session.generation());
        self.stale = false;
        Ok(())
    }

    /// Release the statement on the server. A statement from another session or
    /// generation no longer exists there and is just dropped.
    pub fn close(self, session: &mut Session) -> Result<()> {
        if self.owned_by(session) {
            session.close_statement(self.statement_id)?;
        }
        Ok(())
    }
}
