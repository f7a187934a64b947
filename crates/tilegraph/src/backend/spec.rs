use std::{collections::BTreeMap, fmt, fs, io, path::Path, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::expr::SizeExpr;

/// Scalar element types a fused graph can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    Si8,
    Ui8,
    Si16,
    Ui16,
    Si32,
    Ui32,
    Si64,
    Ui64,
    Bf16,
    F16,
    F32,
    F64,
}

impl DType {
    pub fn is_integer(self) -> bool {
        !self.is_float()
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::Bf16 | DType::F16 | DType::F32 | DType::F64)
    }

    /// Storage size of one element in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::Si8 | DType::Ui8 => 1,
            DType::Si16 | DType::Ui16 | DType::Bf16 | DType::F16 => 2,
            DType::Si32 | DType::Ui32 | DType::F32 => 4,
            DType::Si64 | DType::Ui64 | DType::F64 => 8,
        }
    }
}

/// Names a symbolic size (e.g. `s0`) bound at tiling time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DimSymbol(Arc<str>);

impl DimSymbol {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::<str>::from(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Serialize for DimSymbol {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DimSymbol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(DimSymbol::new(name))
    }
}

/// Identifier of a loop axis owned by a [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AxisId(pub u32);

/// Identifier of a node owned by a [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl fmt::Display for AxisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Loop axis shared by the nodes of one fused graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Axis {
    pub id: AxisId,
    pub name: String,
    pub size: SizeExpr,
}

/// Per-node tensor view: which axes the node iterates and how far along each.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDesc {
    pub dtype: DType,
    pub axes: Vec<AxisId>,
    pub repeats: Vec<SizeExpr>,
}

impl TensorDesc {
    pub fn new(dtype: DType, axes: Vec<AxisId>, repeats: Vec<SizeExpr>) -> Self {
        Self {
            dtype,
            axes,
            repeats,
        }
    }

    pub fn rank(&self) -> usize {
        self.repeats.len()
    }

    pub fn repeat(&self, axis: usize) -> Option<&SizeExpr> {
        self.repeats.get(axis)
    }

    /// Returns all repeats when every one of them is a constant.
    pub fn static_repeats(&self) -> Option<Vec<u64>> {
        self.repeats.iter().map(SizeExpr::as_const).collect()
    }

    /// Element count of the view as a symbolic product.
    pub fn element_count(&self) -> SizeExpr {
        SizeExpr::product(self.repeats.iter().cloned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementwiseOp {
    Abs,
    Neg,
    Exp,
    Relu,
    Add,
    Sub,
    Mul,
    Max,
    Min,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSpec {
    pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastSpec {
    pub dtype: DType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcatSpec {
    pub axis: usize,
}

/// Store into the graph output at `offset` elements along the flattened destination row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSpec {
    pub offset: SizeExpr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub index: usize,
}

/// Operations a fused loop graph is built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Data(DataSpec),
    Load,
    Elementwise(ElementwiseOp),
    Cast(CastSpec),
    Concat(ConcatSpec),
    Store(StoreSpec),
    Output(OutputSpec),
}

impl Operation {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Operation::Data(_) => "data",
            Operation::Load => "load",
            Operation::Elementwise(_) => "elementwise",
            Operation::Cast(_) => "cast",
            Operation::Concat(_) => "concat",
            Operation::Store(_) => "store",
            Operation::Output(_) => "output",
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(self, Operation::Data(_))
    }
}

/// Node attributes are limited to simple primitives so they are easy to serialize and copy.
///
/// `External` values are owned by a runtime outside the graph and cannot be duplicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum NodeAttr {
    Bool(bool),
    I64(i64),
    String(String),
    I64Array(Vec<i64>),
    External(String),
}

impl NodeAttr {
    pub fn is_copyable(&self) -> bool {
        !matches!(self, NodeAttr::External(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub op: Operation,
    pub inputs: Vec<NodeId>,
    pub output: TensorDesc,
    #[serde(default)]
    pub attrs: BTreeMap<String, NodeAttr>,
}

impl Node {
    pub fn bool_attr(&self, key: &str) -> bool {
        matches!(self.attrs.get(key), Some(NodeAttr::Bool(true)))
    }
}

/// One fused loop graph: axes plus nodes kept in topological order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Graph {
    pub name: String,
    pub axes: Vec<Axis>,
    pub nodes: Vec<Node>,
}

#[derive(Debug, Error)]
pub enum GraphSerdeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum GraphIoError {
    #[error(transparent)]
    Serialization(#[from] GraphSerdeError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            axes: Vec::new(),
            nodes: Vec::new(),
        }
    }

    /// Returns a copy carrying a different name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        let mut graph = self.clone();
        graph.name = name.into();
        graph
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.name == name)
    }

    pub fn axis(&self, id: AxisId) -> Option<&Axis> {
        self.axes.iter().find(|axis| axis.id == id)
    }

    /// Nodes matching `pred`, in graph order.
    pub fn nodes_where<'a>(
        &'a self,
        pred: impl Fn(&Node) -> bool + 'a,
    ) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes.iter().filter(move |node| pred(node))
    }

    pub fn count_op(&self, kind: &str) -> usize {
        self.nodes
            .iter()
            .filter(|node| node.op.kind_name() == kind)
            .count()
    }

    pub fn to_json_string(&self) -> Result<String, GraphSerdeError> {
        serde_json::to_string_pretty(self).map_err(GraphSerdeError::from)
    }

    pub fn from_json_str(src: &str) -> Result<Self, GraphSerdeError> {
        serde_json::from_str(src).map_err(GraphSerdeError::from)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<(), GraphIoError> {
        let contents = self.to_json_string()?;
        fs::write(path, contents).map_err(GraphIoError::from)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self, GraphIoError> {
        let contents = fs::read_to_string(path).map_err(GraphIoError::from)?;
        Graph::from_json_str(&contents).map_err(GraphIoError::from)
    }

    pub fn to_text(&self) -> String {
        format!("{self}")
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_line(f, 0, &format!("graph @{} {{", self.name))?;
        if !self.axes.is_empty() {
            write_line(f, 1, "axes:")?;
            for axis in &self.axes {
                write_line(f, 2, &format!("#{} {} = {}", axis.id.0, axis.name, axis.size))?;
            }
        }
        if !self.nodes.is_empty() {
            write_line(f, 1, "nodes:")?;
            for node in &self.nodes {
                fmt_node(node, 2, f)?;
            }
        }
        write_line(f, 0, "}")
    }
}

fn fmt_node(node: &Node, indent: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let inputs = node
        .inputs
        .iter()
        .map(|id| format!("%{}", id.0))
        .collect::<Vec<_>>()
        .join(", ");
    let op_repr = match &node.op {
        Operation::Concat(spec) => format!("concat(axis={})", spec.axis),
        Operation::Store(spec) => format!("store(offset={})", spec.offset),
        Operation::Elementwise(op) => format!("{op:?}").to_lowercase(),
        other => other.kind_name().to_string(),
    };
    let mut line = format!(
        "%{} {} = {}({}) -> {}",
        node.id.0,
        node.name,
        op_repr,
        inputs,
        format_desc(&node.output)
    );
    if !node.attrs.is_empty() {
        let attrs = node
            .attrs
            .iter()
            .map(|(key, value)| format!("{key}={value:?}"))
            .collect::<Vec<_>>()
            .join(", ");
        line.push_str(&format!(" {{{attrs}}}"));
    }
    write_line(f, indent, &line)
}

fn format_desc(desc: &TensorDesc) -> String {
    let dims = desc
        .repeats
        .iter()
        .map(|repeat| repeat.to_string())
        .collect::<Vec<_>>();
    if dims.is_empty() {
        format!("tensor<{:?} x []>", desc.dtype)
    } else {
        format!("tensor<{:?} x {}>", desc.dtype, dims.join("x"))
    }
}

fn write_line(f: &mut fmt::Formatter<'_>, indent: usize, line: &str) -> fmt::Result {
    for _ in 0..indent {
        f.write_str("  ")?;
    }
    writeln!(f, "{line}")
}

/// Lightweight builder for constructing fused graphs programmatically.
///
/// Every node shares the builder's axis list, so only the repeats differ between nodes.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    dtype: Option<DType>,
    axes: Vec<Axis>,
    nodes: Vec<Node>,
    next_data_index: usize,
}

impl GraphBuilder {
    pub fn new(dtype: DType) -> Self {
        Self {
            dtype: Some(dtype),
            ..Self::default()
        }
    }

    /// Registers a loop axis and returns its identifier.
    pub fn axis(&mut self, name: impl Into<String>, size: SizeExpr) -> AxisId {
        let id = AxisId(self.axes.len() as u32);
        self.axes.push(Axis {
            id,
            name: name.into(),
            size,
        });
        id
    }

    fn desc(&self, repeats: Vec<SizeExpr>) -> TensorDesc {
        let axes = self.axes.iter().map(|axis| axis.id).collect();
        TensorDesc::new(self.dtype.unwrap_or(DType::F32), axes, repeats)
    }

    fn push(
        &mut self,
        name: impl Into<String>,
        op: Operation,
        inputs: Vec<NodeId>,
        output: TensorDesc,
    ) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            id,
            name: name.into(),
            op,
            inputs,
            output,
            attrs: BTreeMap::new(),
        });
        id
    }

    /// Graph input with the given repeats.
    pub fn data(&mut self, name: impl Into<String>, repeats: Vec<SizeExpr>) -> NodeId {
        let index = self.next_data_index;
        self.next_data_index += 1;
        let desc = self.desc(repeats);
        self.push(name, Operation::Data(DataSpec { index }), Vec::new(), desc)
    }

    /// `Data -> Load` pair; returns the load.
    pub fn input(&mut self, name: &str, repeats: Vec<SizeExpr>) -> NodeId {
        let data = self.data(name, repeats.clone());
        let desc = self.desc(repeats);
        self.push(format!("load_{name}"), Operation::Load, vec![data], desc)
    }

    /// Elementwise node whose output mirrors its first input.
    pub fn elementwise(
        &mut self,
        name: impl Into<String>,
        op: ElementwiseOp,
        inputs: Vec<NodeId>,
    ) -> NodeId {
        let output = inputs
            .first()
            .and_then(|id| self.nodes.get(id.0 as usize))
            .map(|node| node.output.clone())
            .unwrap_or_else(|| self.desc(Vec::new()));
        self.push(name, Operation::Elementwise(op), inputs, output)
    }

    /// Concat along `axis`; the output repeat on that axis is the sum of the input repeats.
    pub fn concat(&mut self, name: impl Into<String>, axis: usize, inputs: Vec<NodeId>) -> NodeId {
        let mut repeats = inputs
            .first()
            .and_then(|id| self.nodes.get(id.0 as usize))
            .map(|node| node.output.repeats.clone())
            .unwrap_or_default();
        if axis < repeats.len() {
            repeats[axis] = SizeExpr::sum(inputs.iter().filter_map(|id| {
                self.nodes
                    .get(id.0 as usize)
                    .and_then(|node| node.output.repeats.get(axis).cloned())
            }));
        }
        let desc = self.desc(repeats);
        self.push(name, Operation::Concat(ConcatSpec { axis }), inputs, desc)
    }

    pub fn store(&mut self, name: impl Into<String>, input: NodeId) -> NodeId {
        let output = self
            .nodes
            .get(input.0 as usize)
            .map(|node| node.output.clone())
            .unwrap_or_else(|| self.desc(Vec::new()));
        let op = Operation::Store(StoreSpec {
            offset: SizeExpr::zero(),
        });
        self.push(name, op, vec![input], output)
    }

    pub fn output(&mut self, name: impl Into<String>, inputs: Vec<NodeId>) -> NodeId {
        let output = inputs
            .first()
            .and_then(|id| self.nodes.get(id.0 as usize))
            .map(|node| node.output.clone())
            .unwrap_or_else(|| self.desc(Vec::new()));
        self.push(name, Operation::Output(OutputSpec { index: 0 }), inputs, output)
    }

    pub fn set_attr(&mut self, node: NodeId, key: impl Into<String>, value: NodeAttr) {
        if let Some(node) = self.nodes.get_mut(node.0 as usize) {
            node.attrs.insert(key.into(), value);
        }
    }

    pub fn finish(self, name: impl Into<String>) -> Graph {
        Graph {
            name: name.into(),
            axes: self.axes,
            nodes: self.nodes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Graph {
        let mut builder = GraphBuilder::new(DType::F16);
        builder.axis("z0", SizeExpr::constant(4));
        builder.axis("z1", SizeExpr::sym("s0"));
        let a = builder.input("a", vec![SizeExpr::constant(4), SizeExpr::constant(8)]);
        let b = builder.input("b", vec![SizeExpr::constant(4), SizeExpr::sym("s0")]);
        let concat = builder.concat("concat", 1, vec![a, b]);
        let store = builder.store("store", concat);
        builder.output("out", vec![store]);
        builder.finish("sample")
    }

    #[test]
    fn concat_output_sums_input_repeats() {
        let graph = sample();
        let concat = graph.node_by_name("concat").expect("concat node");
        assert_eq!(concat.output.repeats[1].to_string(), "(8 + s0)");
        assert_eq!(concat.output.repeats[0].as_const(), Some(4));
    }

    #[test]
    fn text_dump_lists_axes_and_nodes() {
        let text = sample().to_text();
        assert!(text.starts_with("graph @sample {"));
        assert!(text.contains("#1 z1 = s0"));
        assert!(text.contains("concat(axis=1)(%1, %3) -> tensor<F16 x 4x(8 + s0)>"));
    }

    #[test]
    fn json_round_trip_preserves_graph() {
        let graph = sample();
        let json = graph.to_json_string().expect("serialize graph");
        let decoded = Graph::from_json_str(&json).expect("deserialize graph");
        assert_eq!(decoded, graph);
    }
}
