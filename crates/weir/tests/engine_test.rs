//! End-to-end engine scenarios: dedup, dependency chains, file overwrite
//! detection, declared output files, batches, and maintenance flags.

use std::collections::BTreeMap;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tempfile::TempDir;
use weir::{
    flag, Argument, Integrity, NodeRef, OutputRef, Pipe, PipeSpec, Signature, TaskQuery, Value,
    Weir, WeirError,
};

fn engine(dir: &TempDir) -> Weir {
    Weir::create(dir.path().join("weir.db"), dir.path().join("vault")).unwrap()
}

fn no_kwargs() -> BTreeMap<String, Argument> {
    BTreeMap::new()
}

/// Register `add(i, j)` counting how often the closure actually runs.
fn add_pipe(weir: &Weir, calls: &Arc<AtomicUsize>) -> Pipe {
    let calls = calls.clone();
    weir.register_pipe(
        PipeSpec::named("calc", "add", move |args| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Int(
                args[0].as_int().unwrap() + args[1].as_int().unwrap(),
            ))
        })
        .with_signature(Signature::positional(&["i", "j"])),
    )
    .unwrap()
}

fn int_content(weir: &Weir, task: &weir::Task) -> i64 {
    weir.resource_content(task.returned().unwrap())
        .unwrap()
        .as_int()
        .unwrap()
}

#[tokio::test]
async fn test_deterministic_add_dedups() {
    let dir = TempDir::new().unwrap();
    let weir = engine(&dir);
    let calls = Arc::new(AtomicUsize::new(0));
    let add = add_pipe(&weir, &calls);

    let first = weir
        .run(&add, vec![1.into(), 2.into()], no_kwargs())
        .await
        .unwrap();
    assert_eq!(int_content(&weir, &first), 3);

    let second = weir
        .run(&add, vec![1.into(), 2.into()], no_kwargs())
        .await
        .unwrap();

    // Same task, no second invocation of user code, no new resource.
    assert_eq!(first.id, second.id);
    assert_eq!(first.outputs, second.outputs);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(weir.count_tasks().unwrap(), 1);
}

#[tokio::test]
async fn test_keyword_call_hits_positional_fingerprint() {
    let dir = TempDir::new().unwrap();
    let weir = engine(&dir);
    let calls = Arc::new(AtomicUsize::new(0));
    let add = add_pipe(&weir, &calls);

    let positional = weir
        .run(&add, vec![1.into(), 2.into()], no_kwargs())
        .await
        .unwrap();
    let keyword = weir
        .run(
            &add,
            vec![1.into()],
            BTreeMap::from([("j".to_string(), 2.into())]),
        )
        .await
        .unwrap();
    assert_eq!(positional.id, keyword.id);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dependency_chain_references_resource() {
    let dir = TempDir::new().unwrap();
    let weir = engine(&dir);
    let calls = Arc::new(AtomicUsize::new(0));
    let add = add_pipe(&weir, &calls);

    let t1 = weir
        .run(&add, vec![1.into(), 2.into()], no_kwargs())
        .await
        .unwrap();
    let r1 = t1.returned().unwrap().clone();

    let t2 = weir
        .run(&add, vec![Argument::Resource(r1.clone()), 4.into()], no_kwargs())
        .await
        .unwrap();

    assert_eq!(int_content(&weir, &t2), 7);
    // The input edge references the resource node, not the literal 3.
    assert_eq!(t2.inputs[0], Argument::Resource(r1.clone()));
    assert_eq!(
        weir.consumers(&NodeRef::Resource(r1)).unwrap(),
        vec![t2.id.clone()]
    );
}

#[tokio::test]
async fn test_overwritten_file_input_is_stale() {
    let dir = TempDir::new().unwrap();
    let weir = engine(&dir);
    let path = dir.path().join("a.txt");
    fs::write(&path, "x").unwrap();

    let fr = weir.register_file(&path, false).unwrap();

    let reads = weir
        .register_pipe(
            PipeSpec::named("io", "read_len", |args| {
                let text = fs::read_to_string(args[0].as_str().unwrap())?;
                Ok(Value::Int(text.len() as i64))
            })
            .with_signature(Signature::positional(&["path"])),
        )
        .unwrap();

    // Externally rewrite the file; size is unchanged but content is not.
    fs::write(&path, "y").unwrap();
    let err = weir
        .run(&reads, vec![Argument::File(fr.id.clone())], no_kwargs())
        .await
        .unwrap_err();
    assert!(matches!(err, WeirError::StaleFileResource { .. }));
    assert_eq!(weir.count_tasks().unwrap(), 0);

    // Re-registering creates a new file resource and retires the old one.
    let fr2 = weir.register_file(&path, true).unwrap();
    assert_ne!(fr.id, fr2.id);
    assert!(weir
        .has_info(&NodeRef::File(fr.id.clone()), flag::OVERWRITTEN)
        .unwrap());
    assert_eq!(weir.file_from_path(&path).unwrap().id, fr2.id);

    // The old resource stays stale even with the disk back in shape.
    let err = weir
        .run(&reads, vec![Argument::File(fr.id)], no_kwargs())
        .await
        .unwrap_err();
    assert!(matches!(err, WeirError::StaleFileResource { .. }));
}

fn write_pipe(weir: &Weir, calls: &Arc<AtomicUsize>) -> Pipe {
    let calls = calls.clone();
    weir.register_pipe(
        PipeSpec::named("io", "write_hw", move |args| {
            calls.fetch_add(1, Ordering::SeqCst);
            fs::write(args[0].as_str().unwrap(), "hello")?;
            fs::write(args[1].as_str().unwrap(), "world")?;
            Ok(Value::Null)
        })
        .with_signature(Signature::positional(&["out1", "out2"]))
        .with_output_func(|args| {
            Ok(vec![
                args[0].as_str().unwrap().into(),
                args[1].as_str().unwrap().into(),
            ])
        }),
    )
    .unwrap()
}

#[tokio::test]
async fn test_pipe_with_output_files() {
    let dir = TempDir::new().unwrap();
    let weir = engine(&dir);
    let calls = Arc::new(AtomicUsize::new(0));
    let write_hw = write_pipe(&weir, &calls);

    let out1 = dir.path().join("a.out");
    let out2 = dir.path().join("b.out");
    let args = || {
        vec![
            Argument::from(out1.display().to_string()),
            Argument::from(out2.display().to_string()),
        ]
    };

    let task = weir.run(&write_hw, args(), no_kwargs()).await.unwrap();
    let files: Vec<_> = task.output_files().cloned().collect();
    assert_eq!(files.len(), 2);
    assert_eq!(fs::read_to_string(&out1).unwrap(), "hello");
    assert_eq!(fs::read_to_string(&out2).unwrap(), "world");

    // Output order follows the declared path order.
    let first = weir.get_file(&files[0]).unwrap();
    assert_eq!(first.path, out1);
    assert_eq!(first.task_id.as_ref(), Some(&task.id));
    assert_eq!(weir.integrity_check(&first, true).unwrap(), Integrity::Ok);

    // Same call again: dedup, identical file resources, no re-run.
    let again = weir.run(&write_hw, args(), no_kwargs()).await.unwrap();
    assert_eq!(again.id, task.id);
    assert_eq!(again.outputs, task.outputs);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_non_deterministic_always_runs() {
    let dir = TempDir::new().unwrap();
    let weir = engine(&dir);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let rand = weir
        .register_pipe(
            PipeSpec::named("calc", "rand", move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Int(n as i64))
            })
            .non_deterministic(),
        )
        .unwrap();

    let a = weir.run(&rand, vec![], no_kwargs()).await.unwrap();
    let b = weir.run(&rand, vec![], no_kwargs()).await.unwrap();
    assert_ne!(a.id, b.id);
    assert_ne!(a.returned(), b.returned());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(weir.count_tasks().unwrap(), 2);
}

#[tokio::test]
async fn test_failed_pipe_records_nothing() {
    let dir = TempDir::new().unwrap();
    let weir = engine(&dir);
    let boom = weir
        .register_pipe(PipeSpec::named("calc", "boom", |_| {
            anyhow::bail!("deliberate failure")
        }))
        .unwrap();

    let err = weir.run(&boom, vec![], no_kwargs()).await.unwrap_err();
    assert!(matches!(err, WeirError::PipeExecution(_)));
    assert_eq!(weir.count_tasks().unwrap(), 0);
}

#[tokio::test]
async fn test_batch_dag_runs_in_dataflow_order() {
    let dir = TempDir::new().unwrap();
    let weir = engine(&dir);
    let calls = Arc::new(AtomicUsize::new(0));
    let add = add_pipe(&weir, &calls);

    let mut batch = weir.batch();
    let a = batch
        .call_pipe(&add, vec![1.into(), 2.into()], no_kwargs())
        .unwrap();
    let b = batch
        .call_pipe(&add, vec![3.into(), 4.into()], no_kwargs())
        .unwrap();
    let c = batch
        .call_pipe(
            &add,
            vec![Argument::from(&a), Argument::from(&b)],
            no_kwargs(),
        )
        .unwrap();

    // Nothing runs before execution.
    assert_eq!(weir.count_tasks().unwrap(), 0);
    assert!(a.replacement().is_none());

    let report = weir.execute_batch(batch).await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.completed.len(), 3);
    assert_eq!(weir.count_tasks().unwrap(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let Some(OutputRef::Resource(c_res)) = c.replacement() else {
        panic!("c did not resolve to a resource");
    };
    assert_eq!(
        weir.resource_content(&c_res).unwrap(),
        Value::Int(10)
    );

    // The combining task consumed resources, not literals.
    let c_task = weir.get_task(&weir.producing_task(&NodeRef::Resource(c_res)).unwrap().unwrap())
        .unwrap();
    assert!(matches!(c_task.inputs[0], Argument::Resource(_)));
    assert!(matches!(c_task.inputs[1], Argument::Resource(_)));
}

#[tokio::test]
async fn test_batch_folds_identical_fingerprints() {
    let dir = TempDir::new().unwrap();
    let weir = engine(&dir);
    let calls = Arc::new(AtomicUsize::new(0));
    let add = add_pipe(&weir, &calls);

    let mut batch = weir.batch();
    batch
        .call_pipe(&add, vec![1.into(), 2.into()], no_kwargs())
        .unwrap();
    batch
        .call_pipe(&add, vec![1.into(), 2.into()], no_kwargs())
        .unwrap();

    let report = weir.execute_batch(batch).await.unwrap();
    assert_eq!(report.completed.len(), 2);
    assert_eq!(report.completed[0].1, report.completed[1].1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(weir.count_tasks().unwrap(), 1);
}

#[tokio::test]
async fn test_batch_failure_skips_dependents_only() {
    let dir = TempDir::new().unwrap();
    let weir = engine(&dir);
    let calls = Arc::new(AtomicUsize::new(0));
    let add = add_pipe(&weir, &calls);
    let boom = weir
        .register_pipe(PipeSpec::named("calc", "boom", |_| {
            anyhow::bail!("deliberate failure")
        }))
        .unwrap();

    let mut batch = weir.batch();
    let broken = batch.call_pipe(&boom, vec![], no_kwargs()).unwrap();
    let dependent = batch
        .call_pipe(&add, vec![Argument::from(&broken), 1.into()], no_kwargs())
        .unwrap();
    batch
        .call_pipe(&add, vec![5.into(), 6.into()], no_kwargs())
        .unwrap();

    let report = weir.execute_batch(batch).await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.completed.len(), 1);
    assert!(dependent.replacement().is_none());
}

#[tokio::test]
async fn test_batch_cancellation_skips_everything_pending() {
    let dir = TempDir::new().unwrap();
    let weir = engine(&dir);
    let calls = Arc::new(AtomicUsize::new(0));
    let add = add_pipe(&weir, &calls);

    let mut batch = weir.batch();
    batch
        .call_pipe(&add, vec![1.into(), 2.into()], no_kwargs())
        .unwrap();
    batch
        .call_pipe(&add, vec![3.into(), 4.into()], no_kwargs())
        .unwrap();
    batch.cancel_handle().cancel();

    let report = weir.execute_batch(batch).await.unwrap();
    assert!(report.cancelled);
    assert_eq!(report.skipped.len(), 2);
    assert_eq!(weir.count_tasks().unwrap(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_batch_chains_through_output_files() {
    let dir = TempDir::new().unwrap();
    let weir = engine(&dir);
    let calls = Arc::new(AtomicUsize::new(0));
    let write_hw = write_pipe(&weir, &calls);
    let read = weir
        .register_pipe(
            PipeSpec::named("io", "read_text", |args| {
                Ok(Value::Str(fs::read_to_string(args[0].as_str().unwrap())?))
            })
            .with_signature(Signature::positional(&["path"])),
        )
        .unwrap();

    let out1 = dir.path().join("a.out");
    let out2 = dir.path().join("b.out");

    let mut batch = weir.batch();
    let produced = batch
        .call_pipe(
            &write_hw,
            vec![
                Argument::from(out1.display().to_string()),
                Argument::from(out2.display().to_string()),
            ],
            no_kwargs(),
        )
        .unwrap();
    let first_file = batch.planned_output_file(&produced, 0).unwrap();
    let read_back = batch
        .call_pipe(&read, vec![Argument::from(&first_file)], no_kwargs())
        .unwrap();

    let report = weir.execute_batch(batch).await.unwrap();
    assert!(report.is_success());

    let Some(OutputRef::File(file_id)) = first_file.replacement() else {
        panic!("file placeholder did not resolve");
    };
    assert_eq!(weir.get_file(&file_id).unwrap().path, out1);

    let Some(OutputRef::Resource(text_id)) = read_back.replacement() else {
        panic!("read did not resolve");
    };
    assert_eq!(
        weir.resource_content(&text_id).unwrap(),
        Value::Str("hello".into())
    );
}

#[tokio::test]
async fn test_volatile_resource_is_one_shot() {
    let dir = TempDir::new().unwrap();
    let weir = engine(&dir);
    let gen = weir
        .register_pipe(
            PipeSpec::named("calc", "stream", |_| {
                Ok(Value::List(vec![Value::Int(1), Value::Int(2)]))
            })
            .volatile_return(),
        )
        .unwrap();

    let task = weir.run(&gen, vec![], no_kwargs()).await.unwrap();
    let id = task.returned().unwrap().clone();
    assert_eq!(
        weir.resource_content(&id).unwrap(),
        Value::List(vec![Value::Int(1), Value::Int(2)])
    );
    let err = weir.resource_content(&id).unwrap_err();
    assert!(matches!(err, WeirError::VolatileAlreadyConsumed(_)));
}

#[tokio::test]
async fn test_obsolete_propagates_and_forces_rerun() {
    let dir = TempDir::new().unwrap();
    let weir = engine(&dir);
    let calls = Arc::new(AtomicUsize::new(0));
    let add = add_pipe(&weir, &calls);

    let t1 = weir
        .run(&add, vec![1.into(), 2.into()], no_kwargs())
        .await
        .unwrap();
    let r1 = t1.returned().unwrap().clone();
    let t2 = weir
        .run(&add, vec![Argument::Resource(r1.clone()), 4.into()], no_kwargs())
        .await
        .unwrap();

    let flagged = weir.mark_obsolete(&NodeRef::Task(t1.id.clone())).unwrap();
    assert!(flagged.contains(&NodeRef::Resource(r1.clone())));
    assert!(flagged.contains(&NodeRef::Task(t2.id.clone())));
    assert!(weir
        .has_info(&NodeRef::Task(t2.id.clone()), flag::OBSOLETE)
        .unwrap());

    // The obsolete task no longer satisfies dedup.
    let rerun = weir
        .run(&add, vec![1.into(), 2.into()], no_kwargs())
        .await
        .unwrap();
    assert_ne!(rerun.id, t1.id);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_search_by_pipe_and_argument() {
    let dir = TempDir::new().unwrap();
    let weir = engine(&dir);
    let calls = Arc::new(AtomicUsize::new(0));
    let add = add_pipe(&weir, &calls);

    let hit = weir
        .run(&add, vec![1.into(), 2.into()], no_kwargs())
        .await
        .unwrap();
    weir.run(&add, vec![8.into(), 9.into()], no_kwargs())
        .await
        .unwrap();

    let found = weir
        .search_tasks(&TaskQuery::ByPipe(add.id.clone()).and(TaskQuery::ArgEquals {
            position: Some(0),
            value: Value::Int(1),
        }))
        .unwrap();
    assert_eq!(found, vec![hit.id]);
}

#[tokio::test]
async fn test_vault_sweep_keeps_referenced_payloads() {
    let dir = TempDir::new().unwrap();
    let weir = engine(&dir);
    let calls = Arc::new(AtomicUsize::new(0));
    let add = add_pipe(&weir, &calls);

    let task = weir
        .run(&add, vec![1.into(), 2.into()], no_kwargs())
        .await
        .unwrap();
    assert_eq!(weir.sweep_vault().unwrap(), 0);
    assert_eq!(int_content(&weir, &task), 3);
}

#[tokio::test]
async fn test_unregistered_path_is_unknown() {
    let dir = TempDir::new().unwrap();
    let weir = engine(&dir);
    let err = weir
        .file_from_path(dir.path().join("nothing.bin"))
        .unwrap_err();
    assert!(matches!(err, WeirError::UnknownFile(_)));
}

#[tokio::test]
async fn test_pipe_output_overwriting_tracked_file() {
    let dir = TempDir::new().unwrap();
    let weir = engine(&dir);
    let path = dir.path().join("shared.out");
    fs::write(&path, "original").unwrap();
    let external = weir.register_file(&path, false).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let write_hw = write_pipe(&weir, &calls);
    let other = dir.path().join("other.out");
    let task = weir
        .run(
            &write_hw,
            vec![
                Argument::from(path.display().to_string()),
                Argument::from(other.display().to_string()),
            ],
            no_kwargs(),
        )
        .await
        .unwrap();

    // The externally registered file was displaced by the task's output.
    assert!(weir
        .has_info(&NodeRef::File(external.id.clone()), flag::OVERWRITTEN)
        .unwrap());
    let current = weir.file_from_path(&path).unwrap();
    assert_eq!(current.task_id.as_ref(), Some(&task.id));
}
