//! Structured search over the provenance graph.
//!
//! Predicates compose with and/or/not and compile to a single SQL
//! statement; set intersection is expressed with `id IN (...)` nesting so
//! operands can themselves be compound. Ancestry walks run in Rust over
//! the task edges.

use std::collections::HashSet;

use rusqlite::types::ToSql;

use weir_model::{NodeRef, OutputRef, PipeId, TaskId, Value};

use crate::error::{Result, StoreError};
use crate::store::Store;

/// A composable predicate over tasks.
#[derive(Debug, Clone)]
pub enum TaskQuery {
    /// Tasks executing the given pipe.
    ByPipe(PipeId),
    /// Tasks with a literal argument equal to `value`, optionally pinned
    /// to a bound position.
    ArgEquals {
        position: Option<u32>,
        value: Value,
    },
    /// Tasks whose inputs include the given node, optionally pinned to a
    /// bound position.
    ArgContains {
        position: Option<u32>,
        node: NodeRef,
    },
    And(Vec<TaskQuery>),
    Or(Vec<TaskQuery>),
    Not(Box<TaskQuery>),
}

impl TaskQuery {
    /// Conjunction helper.
    pub fn and(self, other: TaskQuery) -> TaskQuery {
        TaskQuery::And(vec![self, other])
    }

    /// Disjunction helper.
    pub fn or(self, other: TaskQuery) -> TaskQuery {
        TaskQuery::Or(vec![self, other])
    }

    fn compile(&self, sql: &mut String, params: &mut Vec<Box<dyn ToSql>>) -> Result<()> {
        match self {
            TaskQuery::ByPipe(pipe_id) => {
                sql.push_str("SELECT id FROM tasks WHERE pipe_id = ?");
                params.push(Box::new(pipe_id.as_str().to_string()));
            }
            TaskQuery::ArgEquals { position, value } => {
                sql.push_str(
                    "SELECT task_id FROM task_inputs WHERE kind = 'literal' AND literal = ?",
                );
                params.push(Box::new(serde_json::to_string(value)?));
                if let Some(position) = position {
                    sql.push_str(" AND position = ?");
                    params.push(Box::new(*position as i64));
                }
            }
            TaskQuery::ArgContains { position, node } => {
                let kind = match node {
                    NodeRef::Resource(_) => "resource",
                    NodeRef::File(_) => "file",
                    other => {
                        return Err(StoreError::Unsupported(format!(
                            "{} nodes cannot appear as task arguments",
                            other.kind()
                        )));
                    }
                };
                sql.push_str("SELECT task_id FROM task_inputs WHERE kind = ? AND node_id = ?");
                params.push(Box::new(kind.to_string()));
                params.push(Box::new(node.id_str().to_string()));
                if let Some(position) = position {
                    sql.push_str(" AND position = ?");
                    params.push(Box::new(*position as i64));
                }
            }
            TaskQuery::And(terms) => {
                sql.push_str("SELECT id FROM tasks WHERE 1=1");
                for term in terms {
                    sql.push_str(" AND id IN (");
                    term.compile(sql, params)?;
                    sql.push(')');
                }
            }
            TaskQuery::Or(terms) => {
                sql.push_str("SELECT id FROM tasks WHERE 0=1");
                for term in terms {
                    sql.push_str(" OR id IN (");
                    term.compile(sql, params)?;
                    sql.push(')');
                }
            }
            TaskQuery::Not(term) => {
                sql.push_str("SELECT id FROM tasks WHERE id NOT IN (");
                term.compile(sql, params)?;
                sql.push(')');
            }
        }
        Ok(())
    }
}

impl Store {
    /// Tasks matching `query`, ordered by completion time.
    pub fn search_tasks(&self, query: &TaskQuery) -> Result<Vec<TaskId>> {
        let mut inner = String::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();
        query.compile(&mut inner, &mut params)?;
        let sql =
            format!("SELECT id FROM tasks WHERE id IN ({inner}) ORDER BY finished_at, id");

        let conn = self.connection();
        let mut stmt = conn.prepare(&sql)?;
        let refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(refs.as_slice(), |r| r.get::<_, String>(0))?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(TaskId::from(row?));
        }
        Ok(tasks)
    }

    /// Nodes and tasks reachable by walking input edges upward from
    /// `starts`, to `depth` steps (`None` for unbounded). The start nodes
    /// themselves are not included.
    pub fn ancestors(&self, starts: &[NodeRef], depth: Option<u32>) -> Result<HashSet<NodeRef>> {
        self.walk(starts, depth, Direction::Up)
    }

    /// Nodes and tasks reachable by walking output edges downward from
    /// `starts`, to `depth` steps (`None` for unbounded).
    pub fn descendants(&self, starts: &[NodeRef], depth: Option<u32>) -> Result<HashSet<NodeRef>> {
        self.walk(starts, depth, Direction::Down)
    }

    fn walk(
        &self,
        starts: &[NodeRef],
        depth: Option<u32>,
        direction: Direction,
    ) -> Result<HashSet<NodeRef>> {
        let mut visited = HashSet::new();
        let mut pool: Vec<(NodeRef, Option<u32>)> =
            starts.iter().map(|n| (n.clone(), depth)).collect();

        while let Some((node, remaining)) = pool.pop() {
            if remaining == Some(0) {
                continue;
            }
            let next_depth = remaining.map(|d| d - 1);
            for neighbor in self.neighbors(&node, direction)? {
                if visited.insert(neighbor.clone()) {
                    pool.push((neighbor, next_depth));
                }
            }
        }
        Ok(visited)
    }

    fn neighbors(&self, node: &NodeRef, direction: Direction) -> Result<Vec<NodeRef>> {
        match direction {
            Direction::Up => match node {
                NodeRef::Resource(_) | NodeRef::File(_) => Ok(self
                    .producing_task(node)?
                    .map(NodeRef::Task)
                    .into_iter()
                    .collect()),
                NodeRef::Task(id) => {
                    let task = self.get_task(id)?;
                    Ok(task
                        .inputs
                        .iter()
                        .filter_map(|arg| match arg {
                            weir_model::Argument::Resource(r) => {
                                Some(NodeRef::Resource(r.clone()))
                            }
                            weir_model::Argument::File(f) => Some(NodeRef::File(f.clone())),
                            _ => None,
                        })
                        .collect())
                }
                NodeRef::Pipe(_) => Ok(Vec::new()),
            },
            Direction::Down => match node {
                NodeRef::Resource(_) | NodeRef::File(_) => {
                    Ok(self.consumers(node)?.into_iter().map(NodeRef::Task).collect())
                }
                NodeRef::Task(id) => {
                    let task = self.get_task(id)?;
                    Ok(task.outputs.iter().map(NodeRef::from).collect())
                }
                NodeRef::Pipe(id) => Ok(self
                    .search_tasks(&TaskQuery::ByPipe(id.clone()))?
                    .into_iter()
                    .map(NodeRef::Task)
                    .collect()),
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Up,
    Down,
}

/// Extract the task ids out of a traversal result.
pub fn tasks_in(nodes: &HashSet<NodeRef>) -> HashSet<TaskId> {
    nodes
        .iter()
        .filter_map(|n| match n {
            NodeRef::Task(id) => Some(id.clone()),
            _ => None,
        })
        .collect()
}

/// Extract output node refs (resources and files) out of a traversal result.
pub fn outputs_in(nodes: &HashSet<NodeRef>) -> HashSet<OutputRef> {
    nodes
        .iter()
        .filter_map(|n| match n {
            NodeRef::Resource(id) => Some(OutputRef::Resource(id.clone())),
            NodeRef::File(id) => Some(OutputRef::File(id.clone())),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use weir_model::{
        Argument, FileId, OutputRef, Pipe, PipeIdentity, Resource, ResourceId, Signature, Task,
    };

    fn seed_pipe(store: &Store, name: &str) -> Pipe {
        let pipe = Pipe {
            id: PipeId::new(),
            identity: PipeIdentity::named("m", name),
            signature: Signature::positional(&["a"]).variadic(),
            return_volatile: false,
            is_deterministic: true,
            has_output_func: false,
            description: None,
            created_at: Utc::now(),
        };
        store.insert_pipe(&pipe, None, None).unwrap();
        pipe
    }

    fn seed_task(store: &Store, pipe: &Pipe, inputs: Vec<Argument>, fp: &str) -> (Task, Resource) {
        let task_id = TaskId::new();
        let resource = Resource {
            id: ResourceId::new(),
            task_id: task_id.clone(),
            ordinal: 0,
            vault_hash: Some(format!("hash-{fp}")),
            volatile: false,
            description: None,
        };
        let task = Task {
            id: task_id,
            pipe_id: pipe.id.clone(),
            fingerprint: fp.to_string(),
            inputs,
            outputs: vec![OutputRef::Resource(resource.id.clone())],
            started_at: Utc::now(),
            finished_at: Utc::now(),
            description: None,
        };
        store.put_task(&task, &[resource.clone()], &[], &[]).unwrap();
        (task, resource)
    }

    #[test]
    fn test_search_by_pipe_and_literal() {
        let store = Store::open_in_memory().unwrap();
        let add = seed_pipe(&store, "add");
        let mul = seed_pipe(&store, "mul");
        let (t1, _) = seed_task(&store, &add, vec![Argument::Value(Value::Int(1))], "f1");
        seed_task(&store, &mul, vec![Argument::Value(Value::Int(1))], "f2");

        let hits = store
            .search_tasks(&TaskQuery::ByPipe(add.id.clone()).and(TaskQuery::ArgEquals {
                position: Some(0),
                value: Value::Int(1),
            }))
            .unwrap();
        assert_eq!(hits, vec![t1.id]);
    }

    #[test]
    fn test_search_not_excludes() {
        let store = Store::open_in_memory().unwrap();
        let add = seed_pipe(&store, "add");
        let mul = seed_pipe(&store, "mul");
        let (_, _) = seed_task(&store, &add, vec![], "f1");
        let (t2, _) = seed_task(&store, &mul, vec![], "f2");

        let hits = store
            .search_tasks(&TaskQuery::Not(Box::new(TaskQuery::ByPipe(add.id.clone()))))
            .unwrap();
        assert_eq!(hits, vec![t2.id]);
    }

    #[test]
    fn test_descendants_follow_dataflow() {
        let store = Store::open_in_memory().unwrap();
        let add = seed_pipe(&store, "add");
        let (t1, r1) = seed_task(&store, &add, vec![Argument::Value(Value::Int(1))], "f1");
        let (t2, r2) = seed_task(&store, &add, vec![Argument::Resource(r1.id.clone())], "f2");

        let down = store
            .descendants(&[NodeRef::Resource(r1.id.clone())], None)
            .unwrap();
        assert!(down.contains(&NodeRef::Task(t2.id.clone())));
        assert!(down.contains(&NodeRef::Resource(r2.id.clone())));
        assert!(!down.contains(&NodeRef::Task(t1.id.clone())));

        let up = store.ancestors(&[NodeRef::Resource(r2.id)], None).unwrap();
        assert!(up.contains(&NodeRef::Task(t2.id)));
        assert!(up.contains(&NodeRef::Resource(r1.id.clone())));
        assert!(up.contains(&NodeRef::Task(t1.id)));
    }

    #[test]
    fn test_depth_limit_stops_walk() {
        let store = Store::open_in_memory().unwrap();
        let add = seed_pipe(&store, "add");
        let (_, r1) = seed_task(&store, &add, vec![], "f1");
        let (t2, r2) = seed_task(&store, &add, vec![Argument::Resource(r1.id.clone())], "f2");

        // One step down from r1 reaches only the consuming task.
        let down = store
            .descendants(&[NodeRef::Resource(r1.id)], Some(1))
            .unwrap();
        assert!(down.contains(&NodeRef::Task(t2.id)));
        assert!(!down.contains(&NodeRef::Resource(r2.id)));
    }

    #[test]
    fn test_arg_contains_rejects_task_nodes() {
        let store = Store::open_in_memory().unwrap();
        let err = store
            .search_tasks(&TaskQuery::ArgContains {
                position: None,
                node: NodeRef::Task(TaskId::new()),
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::Unsupported(_)));
    }

    #[test]
    fn test_canonical_composition() {
        // descendants({file}) ∩ (by-pipe(x, arg=a) ∪ by-pipe(y, arg=b))
        let store = Store::open_in_memory().unwrap();
        let x = seed_pipe(&store, "x");
        let y = seed_pipe(&store, "y");
        let file = FileId::new();
        let fr = weir_model::FileResource {
            id: file.clone(),
            task_id: None,
            path: "/data/in.bin".into(),
            size: 4,
            md5: "ab".into(),
            registered_at: Utc::now(),
            description: None,
        };
        store.put_file(&fr, None).unwrap();

        let (tx, _) = seed_task(
            &store,
            &x,
            vec![Argument::File(file.clone()), Argument::Value(Value::Int(7))],
            "f1",
        );
        // Same pipe, same file, different parameter: must not match.
        seed_task(
            &store,
            &x,
            vec![Argument::File(file.clone()), Argument::Value(Value::Int(8))],
            "f2",
        );
        // Right parameter, not derived from the file: must not match.
        seed_task(&store, &y, vec![Argument::Value(Value::Int(7))], "f3");

        let derived = tasks_in(&store.descendants(&[NodeRef::File(file)], None).unwrap());
        let by_params = TaskQuery::Or(vec![
            TaskQuery::ByPipe(x.id.clone()).and(TaskQuery::ArgEquals {
                position: Some(1),
                value: Value::Int(7),
            }),
            TaskQuery::ByPipe(y.id.clone()).and(TaskQuery::ArgEquals {
                position: Some(1),
                value: Value::Int(8),
            }),
        ]);
        let matched: Vec<TaskId> = store
            .search_tasks(&by_params)
            .unwrap()
            .into_iter()
            .filter(|t| derived.contains(t))
            .collect();
        assert_eq!(matched, vec![tx.id]);
    }
}
