use anyhow::{Context, Result};
use compflow::graph::{
    collect, postorder_traverse_variables, preorder_traverse_variables, traverse_operations,
    traverse_variables, OperandOrder, VisitOrder,
};
use compflow::{ops, DType, GraphArena, Operation, PrimitiveKind, Shape, Variable};

fn owner(var: &Variable) -> Result<Operation> {
    var.owner().context("variable has no owner")
}

fn uids(root: &Operation, order: VisitOrder, operand_order: OperandOrder) -> Vec<String> {
    let mut seen = Vec::new();
    traverse_variables(root, order, operand_order, |var| seen.push(var.uid()));
    seen
}

#[test]
fn diamond_is_collected_once() -> Result<()> {
    let arena = GraphArena::new();
    let x = arena.input("x", Shape::new([2]), DType::F32);
    let a = ops::relu(&x)?;
    let b = ops::tanh(&x)?;
    let c = ops::plus(&a, &b)?;

    let owned = collect(&owner(&c)?);
    assert_eq!(owned.len(), 3);
    assert!(owned.contains(&owner(&a)?));
    assert!(owned.contains(&owner(&b)?));
    Ok(())
}

#[test]
fn preorder_reports_outputs_before_inputs() -> Result<()> {
    let arena = GraphArena::new();
    let x = arena.input("x", Shape::new([2]), DType::F32);
    let a = ops::relu(&x)?;
    let b = ops::tanh(&x)?;
    let c = ops::plus(&a, &b)?;

    let mut pre = Vec::new();
    preorder_traverse_variables(&owner(&c)?, |var| pre.push(var.clone()));
    assert_eq!(pre, vec![c.clone(), a.clone(), x.clone(), b.clone()]);

    let mut post = Vec::new();
    postorder_traverse_variables(&owner(&c)?, |var| post.push(var.clone()));
    assert_eq!(post, vec![x, a, b, c]);
    Ok(())
}

#[test]
fn natural_order_swaps_matrix_product_operands() -> Result<()> {
    let arena = GraphArena::new();
    let w = arena.parameter("w", compflow::Tensor::zeros(Shape::new([2, 3]), DType::F32));
    let x = arena.input("x", Shape::new([3, 1]), DType::F32);
    let y = ops::times(&w, &x)?;
    assert_eq!(y.shape(), Some(Shape::new([2, 1])));

    let root = owner(&y)?;
    assert_eq!(
        uids(&root, VisitOrder::PreOrder, OperandOrder::Declaration),
        vec![y.uid(), w.uid(), x.uid()]
    );
    assert_eq!(
        uids(&root, VisitOrder::PreOrder, OperandOrder::Natural),
        vec![y.uid(), x.uid(), w.uid()]
    );
    Ok(())
}

#[test]
fn postorder_operations_yield_producers_first() -> Result<()> {
    let arena = GraphArena::new();
    let x = arena.input("x", Shape::new([4]), DType::F32);
    let hidden = ops::sigmoid(&ops::exp(&x)?)?;
    let loss = ops::reduce_sum(&hidden)?;

    let mut kinds = Vec::new();
    traverse_operations(&owner(&loss)?, VisitOrder::PostOrder, |op| {
        kinds.push(op.primitive())
    });
    assert_eq!(
        kinds,
        vec![
            Some(PrimitiveKind::Exp),
            Some(PrimitiveKind::Sigmoid),
            Some(PrimitiveKind::ReduceSum)
        ]
    );
    Ok(())
}

#[test]
fn cycles_from_bad_rewiring_still_terminate() -> Result<()> {
    let arena = GraphArena::new();
    let p = arena.placeholder("p", Some(Shape::new([2])), DType::F32);
    let y = ops::negate(&p)?;
    let z = ops::exp(&y)?;
    let backend = std::sync::Arc::new(compflow_backend_ref_cpu::CpuBackend::new());
    let mut graph = compflow::CompositeGraph::create(owner(&z)?, backend)?;

    // Feeding the graph's own output back into its placeholder closes a loop.
    let replacements = [(p.clone(), z.clone())].into_iter().collect();
    graph.replace_placeholders(&replacements)?;

    let mut visited = 0;
    preorder_traverse_variables(graph.root(), |_| visited += 1);
    assert_eq!(visited, 2);
    assert!(graph.compile(compflow::Device::Cpu).is_err());
    Ok(())
}

#[test]
fn combine_fed_by_its_own_output_is_a_cycle() -> Result<()> {
    let arena = GraphArena::new();
    let p = arena.placeholder("p", Some(Shape::new([2])), DType::F32);
    let root = ops::combine(&[p.clone()])?;
    let output = root.output();
    let backend = std::sync::Arc::new(compflow_backend_ref_cpu::CpuBackend::new());
    let mut graph = compflow::CompositeGraph::create(root, backend)?;

    let replacements = [(p.clone(), output.clone())].into_iter().collect();
    graph.replace_placeholders(&replacements)?;

    let mut requested = [(output.clone(), None)].into_iter().collect();
    let err = graph
        .forward(
            &Default::default(),
            &mut requested,
            compflow::Device::Cpu,
            &Default::default(),
            &Default::default(),
        )
        .err()
        .context("a self-feeding combine must not evaluate")?;
    assert!(
        matches!(
            err,
            compflow::GraphError::Structural(compflow::StructuralError::CycleDetected { .. })
        ),
        "{err}"
    );
    Ok(())
}
