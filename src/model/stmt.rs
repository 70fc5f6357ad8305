//! Read-only statement tree handed over by the host interpreter.
//!
//! The tree is produced once per compiled incarnation and never mutated
//! afterwards, so statements can be identified by address while the owning
//! `CompiledUnit` is alive.

/// Loop flavours. They differ only in how the host iterates; the profiler
/// treats every one of them as "a body that runs zero or more times".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    Loop,
    While,
    ForInt,
    ForQuery,
    ForCursor,
    ForDynamic,
    ForEachArray,
}

/// Leaf statement kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimpleKind {
    Assign,
    Perform,
    ExecSql,
    DynExecute,
    Return,
    ReturnNext,
    ReturnQuery,
    Raise,
    Assert,
    Exit,
    Open,
    Fetch,
    Close,
    GetDiag,
    Call,
    Commit,
    Rollback,
}

/// Statement payload
#[derive(Debug, Clone)]
pub enum StmtKind {
    /// Sequential block with optional exception handlers
    Block {
        label: Option<String>,
        body: Vec<Stmt>,
        handlers: Vec<Vec<Stmt>>,
    },

    /// Conditional with elsif chain
    If {
        then_body: Vec<Stmt>,
        elsifs: Vec<Vec<Stmt>>,
        else_body: Option<Vec<Stmt>>,
    },

    /// Multi-way conditional
    Case {
        whens: Vec<Vec<Stmt>>,
        else_body: Option<Vec<Stmt>>,
    },

    Loop {
        kind: LoopKind,
        body: Vec<Stmt>,
    },

    Simple {
        kind: SimpleKind,
        query_fingerprint: Option<u64>,
    },
}

/// One statement node
#[derive(Debug, Clone)]
pub struct Stmt {
    /// Host-assigned id (1-based, never recycled). Older hosts have none.
    pub native_id: Option<u32>,

    /// Source line; 0 marks synthetic statements (-1 is reserved for
    /// unused record slots)
    pub line_number: i32,

    pub kind: StmtKind,
}

impl Stmt {
    pub fn new(line_number: i32, kind: StmtKind) -> Self {
        Self {
            native_id: None,
            line_number,
            kind,
        }
    }

    pub fn simple(line_number: i32, kind: SimpleKind) -> Self {
        Self::new(
            line_number,
            StmtKind::Simple {
                kind,
                query_fingerprint: None,
            },
        )
    }

    pub fn query(line_number: i32, kind: SimpleKind, fingerprint: u64) -> Self {
        Self::new(
            line_number,
            StmtKind::Simple {
                kind,
                query_fingerprint: Some(fingerprint),
            },
        )
    }

    pub fn block(line_number: i32, body: Vec<Stmt>) -> Self {
        Self::new(
            line_number,
            StmtKind::Block {
                label: None,
                body,
                handlers: Vec::new(),
            },
        )
    }

    pub fn block_with_handlers(line_number: i32, body: Vec<Stmt>, handlers: Vec<Vec<Stmt>>) -> Self {
        Self::new(
            line_number,
            StmtKind::Block {
                label: None,
                body,
                handlers,
            },
        )
    }

    pub fn if_then(
        line_number: i32,
        then_body: Vec<Stmt>,
        elsifs: Vec<Vec<Stmt>>,
        else_body: Option<Vec<Stmt>>,
    ) -> Self {
        Self::new(
            line_number,
            StmtKind::If {
                then_body,
                elsifs,
                else_body,
            },
        )
    }

    pub fn case(line_number: i32, whens: Vec<Vec<Stmt>>, else_body: Option<Vec<Stmt>>) -> Self {
        Self::new(line_number, StmtKind::Case { whens, else_body })
    }

    pub fn looping(line_number: i32, kind: LoopKind, body: Vec<Stmt>) -> Self {
        Self::new(line_number, StmtKind::Loop { kind, body })
    }

    pub fn with_native_id(mut self, native_id: u32) -> Self {
        self.native_id = Some(native_id);
        self
    }

    pub fn with_label(mut self, new_label: impl Into<String>) -> Self {
        if let StmtKind::Block { label, .. } = &mut self.kind {
            *label = Some(new_label.into());
        }
        self
    }

    /// Synthetic statements (implicit outer block, generated returns)
    /// have no source line.
    pub fn is_visible(&self) -> bool {
        self.line_number >= 1
    }

    pub fn is_compound(&self) -> bool {
        !matches!(self.kind, StmtKind::Simple { .. })
    }

    pub fn query_fingerprint(&self) -> Option<u64> {
        match self.kind {
            StmtKind::Simple {
                query_fingerprint, ..
            } => query_fingerprint,
            _ => None,
        }
    }

    /// Number of statements in this subtree, including `self`
    pub fn count(&self) -> usize {
        1 + self.child_lists().map(|list| list.iter().map(Stmt::count).sum::<usize>()).sum::<usize>()
    }

    /// Child statement lists in source order
    pub fn child_lists(&self) -> impl Iterator<Item = &[Stmt]> {
        let lists: Vec<&[Stmt]> = match &self.kind {
            StmtKind::Block { body, handlers, .. } => std::iter::once(body.as_slice())
                .chain(handlers.iter().map(Vec::as_slice))
                .collect(),
            StmtKind::If {
                then_body,
                elsifs,
                else_body,
            } => std::iter::once(then_body.as_slice())
                .chain(elsifs.iter().map(Vec::as_slice))
                .chain(else_body.iter().map(Vec::as_slice))
                .collect(),
            StmtKind::Case { whens, else_body } => whens
                .iter()
                .map(Vec::as_slice)
                .chain(else_body.iter().map(Vec::as_slice))
                .collect(),
            StmtKind::Loop { body, .. } => vec![body.as_slice()],
            StmtKind::Simple { .. } => Vec::new(),
        };
        lists.into_iter()
    }

    /// Human-readable statement type, as shown in result rows
    pub fn typename(&self) -> &'static str {
        match &self.kind {
            StmtKind::Block { .. } => "statement block",
            StmtKind::If { .. } => "IF",
            StmtKind::Case { .. } => "CASE",
            StmtKind::Loop { kind, .. } => match kind {
                LoopKind::Loop => "LOOP",
                LoopKind::While => "WHILE",
                LoopKind::ForInt => "FOR with integer loop variable",
                LoopKind::ForQuery => "FOR over SELECT rows",
                LoopKind::ForCursor => "FOR over cursor",
                LoopKind::ForDynamic => "FOR over EXECUTE statement",
                LoopKind::ForEachArray => "FOREACH over array",
            },
            StmtKind::Simple { kind, .. } => match kind {
                SimpleKind::Assign => "assignment",
                SimpleKind::Perform => "PERFORM",
                SimpleKind::ExecSql => "SQL statement",
                SimpleKind::DynExecute => "EXECUTE",
                SimpleKind::Return => "RETURN",
                SimpleKind::ReturnNext => "RETURN NEXT",
                SimpleKind::ReturnQuery => "RETURN QUERY",
                SimpleKind::Raise => "RAISE",
                SimpleKind::Assert => "ASSERT",
                SimpleKind::Exit => "EXIT",
                SimpleKind::Open => "OPEN",
                SimpleKind::Fetch => "FETCH",
                SimpleKind::Close => "CLOSE",
                SimpleKind::GetDiag => "GET DIAGNOSTICS",
                SimpleKind::Call => "CALL",
                SimpleKind::Commit => "COMMIT",
                SimpleKind::Rollback => "ROLLBACK",
            },
        }
    }
}
