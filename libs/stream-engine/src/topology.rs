use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::Arc;

use stream_api::computation::{Computation, ComputationMetadata, ComputationSupplier};

use crate::error::EngineError;
use crate::settings::Settings;

/// Computation metadata with its slots bound to concrete streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputationMapping {
    metadata: ComputationMetadata,
    /// slot -> stream
    streams: BTreeMap<String, String>,
}

impl ComputationMapping {
    pub fn name(&self) -> &str {
        self.metadata.name()
    }

    pub fn metadata(&self) -> &ComputationMetadata {
        &self.metadata
    }

    /// Stream bound to a slot.
    pub fn map(&self, slot: &str) -> Option<&str> {
        self.streams.get(slot).map(String::as_str)
    }

    /// Slot bound to a stream, inputs first.
    pub fn reverse_map(&self, stream: &str) -> Option<&str> {
        let slots = self.metadata.inputs().iter().chain(self.metadata.outputs());
        slots
            .filter(|slot| self.map(slot) == Some(stream))
            .map(String::as_str)
            .next()
    }

    /// Input streams in slot order.
    pub fn input_streams(&self) -> Vec<&str> {
        self.metadata.inputs().iter().filter_map(|s| self.map(s)).collect()
    }

    /// Output streams in slot order.
    pub fn output_streams(&self) -> Vec<&str> {
        self.metadata.outputs().iter().filter_map(|s| self.map(s)).collect()
    }
}

struct Entry {
    mapping: ComputationMapping,
    supplier: ComputationSupplier,
}

/// Wiring graph of computations and the streams between them.
pub struct Topology {
    entries: Vec<Entry>,
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| &e.mapping))
            .finish()
    }
}

impl Topology {
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::default()
    }

    /// Computation names in declaration order.
    pub fn computations(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.mapping.name()).collect()
    }

    /// Every stream read or written by a computation, sorted.
    pub fn streams(&self) -> BTreeSet<&str> {
        self.entries
            .iter()
            .flat_map(|e| e.mapping.streams.values().map(String::as_str))
            .collect()
    }

    pub fn metadata(&self, computation: &str) -> Option<&ComputationMapping> {
        self.entry(computation).map(|e| &e.mapping)
    }

    pub(crate) fn supplier(&self, computation: &str) -> Option<&ComputationSupplier> {
        self.entry(computation).map(|e| &e.supplier)
    }

    fn entry(&self, computation: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.mapping.name() == computation)
    }

    /// Computations writing to a stream.
    pub fn parents(&self, stream: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.mapping.output_streams().contains(&stream))
            .map(|e| e.mapping.name())
            .collect()
    }

    /// Computations reading a stream.
    pub fn children(&self, stream: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.mapping.input_streams().contains(&stream))
            .map(|e| e.mapping.name())
            .collect()
    }

    /// A computation without input streams.
    pub fn is_source(&self, computation: &str) -> bool {
        self.metadata(computation)
            .is_some_and(|m| m.metadata().inputs().is_empty())
    }

    /// PlantUML component diagram of the topology.
    pub fn to_plantuml(&self, settings: &Settings) -> String {
        let mut out = String::from("@startuml\n");
        for stream in self.streams() {
            let _ = writeln!(
                out,
                "queue \"{stream}\" as {} <<{} partitions>>",
                plantuml_id(stream),
                settings.partitions(stream)
            );
        }
        for entry in &self.entries {
            let name = entry.mapping.name();
            let _ = writeln!(
                out,
                "component \"{name}\" as {} <<x{}>>",
                plantuml_id(name),
                settings.concurrency(name)
            );
            for input in entry.mapping.input_streams() {
                let _ = writeln!(out, "{} ==> {}", plantuml_id(input), plantuml_id(name));
            }
            for output in entry.mapping.output_streams() {
                let _ = writeln!(out, "{} ==> {}", plantuml_id(name), plantuml_id(output));
            }
        }
        out.push_str("@enduml\n");
        out
    }
}

fn plantuml_id(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[derive(Default)]
pub struct TopologyBuilder {
    pending: Vec<(ComputationSupplier, Vec<String>)>,
}

impl TopologyBuilder {
    /// Register a computation with its `slot:stream` bindings, e.g. `"i1:s1"`.
    pub fn add_computation<F, S>(mut self, supplier: F, mapping: impl IntoIterator<Item = S>) -> Self
    where
        F: Fn() -> Box<dyn Computation> + Send + Sync + 'static,
        S: Into<String>,
    {
        self.pending
            .push((Arc::new(supplier), mapping.into_iter().map(Into::into).collect()));
        self
    }

    pub fn build(self) -> Result<Topology, EngineError> {
        let mut entries: Vec<Entry> = Vec::new();
        for (supplier, bindings) in self.pending {
            let metadata = supplier().metadata();
            let ctx = format!("computation '{}'", metadata.name());
            if entries.iter().any(|e| e.mapping.name() == metadata.name()) {
                return Err(EngineError::Topology(format!("duplicate {ctx}")));
            }
            let streams = parse_bindings(&metadata, &bindings).map_err(|e| e.with_context(&ctx))?;
            entries.push(Entry {
                mapping: ComputationMapping { metadata, streams },
                supplier,
            });
        }
        Ok(Topology { entries })
    }
}

fn parse_bindings(
    metadata: &ComputationMetadata,
    bindings: &[String],
) -> Result<BTreeMap<String, String>, EngineError> {
    let mut streams = BTreeMap::new();
    for binding in bindings {
        let (slot, stream) = binding
            .split_once(':')
            .filter(|(slot, stream)| !slot.is_empty() && !stream.is_empty())
            .ok_or_else(|| EngineError::Topology(format!("invalid mapping '{binding}', expected 'slot:stream'")))?;
        let known = metadata.inputs().iter().chain(metadata.outputs()).any(|s| s == slot);
        if !known {
            return Err(EngineError::Topology(format!("unknown slot '{slot}'")));
        }
        if streams.insert(slot.to_string(), stream.to_string()).is_some() {
            return Err(EngineError::Topology(format!("slot '{slot}' mapped twice")));
        }
    }
    let missing: Vec<&str> = metadata
        .inputs()
        .iter()
        .chain(metadata.outputs())
        .filter(|s| !streams.contains_key(*s))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(EngineError::Topology(format!("missing mapping for {}", missing.join(", "))));
    }
    Ok(streams)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stream_api::{ComputationContext, ComputationError, Record};

    struct Noop(ComputationMetadata);

    impl Computation for Noop {
        fn metadata(&self) -> ComputationMetadata {
            self.0.clone()
        }

        fn init(&mut self, _ctx: &mut dyn ComputationContext) -> Result<(), ComputationError> {
            Ok(())
        }

        fn process_record(
            &mut self,
            _ctx: &mut dyn ComputationContext,
            _input: &str,
            _record: &Record,
        ) -> Result<(), ComputationError> {
            Ok(())
        }
    }

    fn noop(name: &'static str, inputs: usize, outputs: usize) -> impl Fn() -> Box<dyn Computation> + Send + Sync {
        move || Box::new(Noop(ComputationMetadata::with_counts(name, inputs, outputs))) as Box<dyn Computation>
    }

    #[test]
    fn graph_is_derived_from_mappings() {
        let topology = Topology::builder()
            .add_computation(noop("SOURCE", 0, 1), ["o1:s1"])
            .add_computation(noop("C1", 1, 2), ["i1:s1", "o1:s2", "o2:s3"])
            .add_computation(noop("C2", 2, 1), ["i1:s2", "i2:s3", "o1:out"])
            .build()
            .unwrap();

        assert_eq!(topology.computations(), vec!["SOURCE", "C1", "C2"]);
        assert_eq!(topology.streams().into_iter().collect::<Vec<_>>(), vec!["out", "s1", "s2", "s3"]);
        assert_eq!(topology.parents("s2"), vec!["C1"]);
        assert_eq!(topology.children("s1"), vec!["C1"]);
        assert!(topology.children("out").is_empty());
        assert!(topology.is_source("SOURCE"));
        assert!(!topology.is_source("C1"));

        let c2 = topology.metadata("C2").unwrap();
        assert_eq!(c2.input_streams(), vec!["s2", "s3"]);
        assert_eq!(c2.reverse_map("s3"), Some("i2"));
        assert_eq!(c2.map("o1"), Some("out"));

        let uml = topology.to_plantuml(&Settings::new(1, 2));
        assert!(uml.contains("s1 ==> C1"));
        assert!(uml.contains("C2 ==> out"));
    }

    #[test]
    fn invalid_mappings_are_rejected() {
        let unknown = Topology::builder().add_computation(noop("C1", 1, 1), ["i1:s1", "o2:s2"]).build();
        assert!(matches!(unknown, Err(EngineError::Topology(msg)) if msg.contains("unknown slot 'o2'")));

        let missing = Topology::builder().add_computation(noop("C1", 1, 1), ["i1:s1"]).build();
        assert!(matches!(missing, Err(EngineError::Topology(msg)) if msg.contains("missing mapping for o1")));

        let malformed = Topology::builder().add_computation(noop("C1", 1, 0), ["i1"]).build();
        assert!(matches!(malformed, Err(EngineError::Topology(_))));

        let duplicate = Topology::builder()
            .add_computation(noop("C1", 0, 1), ["o1:s1"])
            .add_computation(noop("C1", 0, 1), ["o1:s2"])
            .build();
        assert!(matches!(duplicate, Err(EngineError::Topology(msg)) if msg.contains("duplicate")));
    }
}
