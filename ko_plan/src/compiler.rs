//! ABOUTME: Compiles validated komposition documents into build-plan DAGs
//! ABOUTME: Also decompiles plans back to documents and persists both as JSON

use crate::komposition::{AudioSpec, Komposition, Segment, SegmentParams, ValidationReport};
use crate::plan::{BuildPlan, NodeInput, PlanNode, Produces, SegmentBinding};
use ko_core::{Error, Id, Result};
use ko_ops::{
    ApplyFilterParams, ConcatParams, Operation, ReplaceAudioParams, TrimParams,
};
use ko_registry::{FileId, FileRegistry, RootName};
use std::{path::PathBuf, sync::Arc};
use tracing::{debug, info, instrument};

/// A successful compilation: the plan plus non-fatal findings
#[derive(Debug, Clone)]
pub struct CompiledPlan {
    pub plan: BuildPlan,
    pub report: ValidationReport,
}

/// Komposition-to-plan compiler
///
/// Validation that needs the registry (referential checks) happens here;
/// structural validation lives on the document itself.
pub struct Compiler {
    registry: Arc<FileRegistry>,
}

impl Compiler {
    pub fn new(registry: Arc<FileRegistry>) -> Self {
        Self { registry }
    }

    /// Validate fully and compile to a topologically ordered DAG
    #[instrument(skip(self, komposition))]
    pub async fn compile(&self, komposition: &Komposition) -> Result<CompiledPlan> {
        let mut report = komposition.validate_structure();

        for (index, segment) in komposition.segments.iter().enumerate() {
            let id = FileId::from(segment.source_ref.as_str());
            if self.registry.resolve(&id).await.is_err() {
                report.error(
                    format!("segments[{}].sourceRef", index),
                    format!("{} is not a registered file", segment.source_ref),
                );
            }
        }
        if let Some(audio) = &komposition.audio {
            let id = FileId::from(audio.background_music.as_str());
            if self.registry.resolve(&id).await.is_err() {
                report.error(
                    "audio.backgroundMusic",
                    format!("{} is not a registered file", audio.background_music),
                );
            }
        }

        if report.is_fatal() {
            return Err(Error::PlanCompile(report.summarize_errors()));
        }

        let plan = build_nodes(komposition, &mut report);
        plan.validate()?;

        info!(
            plan_id = %plan.id,
            nodes = plan.nodes.len(),
            cost_s = plan.total_estimated_cost_s,
            "Komposition compiled"
        );
        Ok(CompiledPlan { plan, report })
    }

    /// Write a komposition document into the metadata root and register it
    pub async fn persist_komposition(
        &self,
        komposition: &Komposition,
    ) -> Result<(FileId, PathBuf)> {
        let name = format!("komposition-{}", Id::new().to_string().to_lowercase());
        let path = self
            .registry
            .derive_output_path(&name, "json", RootName::Metadata);
        let json = serde_json::to_string_pretty(komposition)
            .map_err(|e| Error::Config(format!("Failed to serialize komposition: {}", e)))?;
        tokio::fs::write(&path, json).await?;
        let id = self.registry.register(&path).await?;
        Ok((id, path))
    }

    /// Write a compiled plan into the metadata root and register it
    pub async fn persist_plan(&self, plan: &BuildPlan) -> Result<(FileId, PathBuf)> {
        let name = format!("plan-{}", plan.id.to_string().to_lowercase());
        let path = self
            .registry
            .derive_output_path(&name, "json", RootName::Metadata);
        let json = serde_json::to_string_pretty(plan)
            .map_err(|e| Error::Config(format!("Failed to serialize plan: {}", e)))?;
        tokio::fs::write(&path, json).await?;
        let id = self.registry.register(&path).await?;
        Ok((id, path))
    }
}

fn build_nodes(komposition: &Komposition, report: &mut ValidationReport) -> BuildPlan {
    let total_duration = komposition.metadata.estimated_duration;
    let mut nodes: Vec<PlanNode> = Vec::new();
    let mut segment_terminals: Vec<String> = Vec::new();

    // Per-segment trim, then its filter chain
    for (index, segment) in komposition.segments.iter().enumerate() {
        let trim_id = format!("seg{}-trim", index);
        nodes.push(PlanNode {
            id: trim_id.clone(),
            op: Operation::Trim(TrimParams {
                start: segment.params.start,
                duration: segment.params.duration,
            }),
            inputs: vec![NodeInput::File(FileId::from(segment.source_ref.as_str()))],
            produces: Produces {
                name: trim_id.clone(),
                ext: "mp4".to_string(),
            },
            estimated_cost_s: (segment.params.duration * 0.2).max(0.5),
        });

        let mut upstream = trim_id;
        for (filter_index, filter) in segment.filters.iter().enumerate() {
            let filter_id = format!("seg{}-filter{}", index, filter_index);
            nodes.push(PlanNode {
                id: filter_id.clone(),
                op: Operation::ApplyFilter(ApplyFilterParams {
                    filter: filter.clone(),
                }),
                inputs: vec![NodeInput::Node(upstream)],
                produces: Produces {
                    name: filter_id.clone(),
                    ext: "mp4".to_string(),
                },
                estimated_cost_s: (segment.params.duration * 0.5).max(1.0),
            });
            upstream = filter_id;
        }
        segment_terminals.push(upstream);
    }

    // Uniform source material needs no normalization pass; anything mixed
    // gets one (the dispatcher re-checks against real probes either way)
    let uniform = komposition
        .segments
        .windows(2)
        .all(|pair| pair[0].source_ref == pair[1].source_ref);
    if !uniform {
        debug!("Mixed segment sources, concat will normalize");
    }
    let concat_cost = if uniform {
        (total_duration * 0.1).max(1.0)
    } else {
        (total_duration * 0.6).max(1.0)
    };
    nodes.push(PlanNode {
        id: "concat".to_string(),
        op: Operation::Concat(ConcatParams { normalize: !uniform }),
        inputs: segment_terminals.into_iter().map(NodeInput::Node).collect(),
        produces: Produces {
            name: "concat".to_string(),
            ext: "mp4".to_string(),
        },
        estimated_cost_s: concat_cost,
    });
    let mut upstream = "concat".to_string();

    // Background music replaces the concatenated track's audio
    if let Some(audio) = &komposition.audio {
        let (fade_in, fade_out) = komposition.global_fade().unwrap_or((0.0, 0.0));
        nodes.push(PlanNode {
            id: "audio-mix".to_string(),
            op: Operation::ReplaceAudio(ReplaceAudioParams {
                music_volume: audio.music_volume,
                fade_in,
                fade_out,
            }),
            inputs: vec![
                NodeInput::Node(upstream),
                NodeInput::File(FileId::from(audio.background_music.as_str())),
            ],
            produces: Produces {
                name: "audio-mix".to_string(),
                ext: "mp4".to_string(),
            },
            estimated_cost_s: (total_duration * 0.2).max(1.0),
        });
        upstream = "audio-mix".to_string();
    } else if komposition.global_fade().is_some() {
        report.warning(
            "global_filters",
            "fade declared without background music; applied to video only",
        );
    }

    // Whole-video filter chain
    for (filter_index, filter) in komposition.global_filters.iter().enumerate() {
        let filter_id = format!("global-filter{}", filter_index);
        nodes.push(PlanNode {
            id: filter_id.clone(),
            op: Operation::ApplyFilter(ApplyFilterParams {
                filter: filter.clone(),
            }),
            inputs: vec![NodeInput::Node(upstream)],
            produces: Produces {
                name: filter_id.clone(),
                ext: "mp4".to_string(),
            },
            estimated_cost_s: (total_duration * 0.5).max(1.0),
        });
        upstream = filter_id;
    }

    // Terminal user-facing encode
    nodes.push(PlanNode {
        id: "final-encode".to_string(),
        op: Operation::YoutubeRecommendedEncode,
        inputs: vec![NodeInput::Node(upstream)],
        produces: Produces {
            name: "final-encode".to_string(),
            ext: "mp4".to_string(),
        },
        estimated_cost_s: (total_duration * 0.5).max(2.0),
    });

    let total_estimated_cost_s = nodes.iter().map(|node| node.estimated_cost_s).sum();

    BuildPlan {
        id: Id::new(),
        metadata: komposition.metadata.clone(),
        segment_bindings: komposition
            .segments
            .iter()
            .map(|segment| SegmentBinding {
                segment_id: segment.id.clone(),
                role: segment.musical_role,
            })
            .collect(),
        music_volume: komposition.audio.as_ref().map(|audio| audio.music_volume),
        effects_tree: komposition.effects_tree.clone(),
        extra: komposition.extra.clone(),
        nodes,
        total_estimated_cost_s,
    }
}

/// Serialize a plan's input-file bindings back into the komposition it was
/// compiled from
pub fn decompile(plan: &BuildPlan) -> Komposition {
    let mut segments: Vec<Segment> = Vec::new();
    let mut audio: Option<AudioSpec> = None;
    let mut global_filters = Vec::new();

    for node in &plan.nodes {
        match &node.op {
            Operation::Trim(params) if node.id.starts_with("seg") => {
                let source_ref = node
                    .inputs
                    .iter()
                    .find_map(|input| match input {
                        NodeInput::File(id) => Some(id.to_string()),
                        NodeInput::Node(_) => None,
                    })
                    .unwrap_or_default();
                let binding = plan
                    .segment_bindings
                    .get(segments.len())
                    .cloned()
                    .unwrap_or_default();
                segments.push(Segment {
                    id: binding.segment_id,
                    source_ref,
                    musical_role: binding.role,
                    params: SegmentParams {
                        start: params.start,
                        duration: params.duration,
                    },
                    filters: Vec::new(),
                });
            }
            Operation::ApplyFilter(params) if node.id.starts_with("seg") => {
                if let Some(segment) = segments.last_mut() {
                    segment.filters.push(params.filter.clone());
                }
            }
            Operation::ApplyFilter(params) if node.id.starts_with("global-") => {
                global_filters.push(params.filter.clone());
            }
            Operation::ReplaceAudio(params) => {
                let background_music = node
                    .inputs
                    .iter()
                    .find_map(|input| match input {
                        NodeInput::File(id) => Some(id.to_string()),
                        NodeInput::Node(_) => None,
                    })
                    .unwrap_or_default();
                audio = Some(AudioSpec {
                    background_music,
                    music_volume: plan.music_volume.unwrap_or(params.music_volume),
                });
            }
            _ => {}
        }
    }

    Komposition {
        metadata: plan.metadata.clone(),
        segments,
        audio,
        global_filters,
        effects_tree: plan.effects_tree.clone(),
        extra: plan.extra.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::komposition::{KompositionMetadata, MusicalRole};
    use ko_ops::FilterSpec;
    use ko_registry::WorkspaceRoots;
    use test_support::TestWorkspace;

    async fn setup(ws: &TestWorkspace) -> (Compiler, Arc<FileRegistry>, FileId, FileId, FileId) {
        let roots = WorkspaceRoots::standard(ws.dir.path()).unwrap();
        let registry = Arc::new(FileRegistry::new(roots));
        let v1 = registry
            .register(&ws.write_fake_mp4("source", "v1.mp4"))
            .await
            .unwrap();
        let v2 = registry
            .register(&ws.write_fake_mp4("source", "v2.mp4"))
            .await
            .unwrap();
        let music = registry
            .register(&ws.write_fake_flac("source", "music.flac"))
            .await
            .unwrap();
        (Compiler::new(Arc::clone(&registry)), registry, v1, v2, music)
    }

    fn komposition(v1: &FileId, v2: &FileId, music: &FileId) -> Komposition {
        Komposition {
            metadata: KompositionMetadata {
                title: Some("demo".to_string()),
                bpm: 120.0,
                total_beats: 32,
                estimated_duration: 16.0,
            },
            segments: vec![
                Segment {
                    id: None,
                    source_ref: v1.to_string(),
                    musical_role: Some(MusicalRole::Intro),
                    params: SegmentParams {
                        start: 0.0,
                        duration: 4.0,
                    },
                    filters: Vec::new(),
                },
                Segment {
                    id: None,
                    source_ref: v2.to_string(),
                    musical_role: Some(MusicalRole::Verse),
                    params: SegmentParams {
                        start: 0.0,
                        duration: 4.0,
                    },
                    filters: Vec::new(),
                },
                Segment {
                    id: None,
                    source_ref: v1.to_string(),
                    musical_role: Some(MusicalRole::Refrain),
                    params: SegmentParams {
                        start: 5.0,
                        duration: 4.0,
                    },
                    filters: Vec::new(),
                },
                Segment {
                    id: None,
                    source_ref: v1.to_string(),
                    musical_role: Some(MusicalRole::Outro),
                    params: SegmentParams {
                        start: 10.0,
                        duration: 4.0,
                    },
                    filters: Vec::new(),
                },
            ],
            audio: Some(AudioSpec {
                background_music: music.to_string(),
                music_volume: 0.8,
            }),
            global_filters: Vec::new(),
            effects_tree: None,
            extra: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn test_compile_shape_matches_scenario() {
        let ws = TestWorkspace::new();
        let (compiler, _, v1, v2, music) = setup(&ws).await;
        let doc = komposition(&v1, &v2, &music);

        let compiled = compiler.compile(&doc).await.unwrap();
        let plan = compiled.plan;
        plan.validate().unwrap();

        // 4 trims -> 1 concat -> 1 replace_audio -> 1 terminal encode
        let names: Vec<&str> = plan.nodes.iter().map(|n| n.op.name()).collect();
        assert_eq!(
            names,
            [
                "trim",
                "trim",
                "trim",
                "trim",
                "concat",
                "replace_audio",
                "youtube_recommended_encode"
            ]
        );
        assert_eq!(plan.terminal().unwrap().id, "final-encode");
        assert!(plan.total_estimated_cost_s > 0.0);
    }

    #[tokio::test]
    async fn test_compile_rejects_unknown_source() {
        let ws = TestWorkspace::new();
        let (compiler, _, v1, v2, music) = setup(&ws).await;
        let mut doc = komposition(&v1, &v2, &music);
        doc.segments[2].source_ref = "file_deadbeef".to_string();

        match compiler.compile(&doc).await {
            Err(Error::PlanCompile(message)) => {
                assert!(message.contains("segments[2].sourceRef"));
            }
            other => panic!("expected PlanCompile, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_compile_rejects_structural_errors() {
        let ws = TestWorkspace::new();
        let (compiler, _, v1, v2, music) = setup(&ws).await;
        let mut doc = komposition(&v1, &v2, &music);
        doc.metadata.bpm = 0.0;

        assert!(compiler.compile(&doc).await.is_err());
    }

    #[tokio::test]
    async fn test_segment_filters_chain_between_trim_and_concat() {
        let ws = TestWorkspace::new();
        let (compiler, _, v1, v2, music) = setup(&ws).await;
        let mut doc = komposition(&v1, &v2, &music);
        doc.segments[0].filters = vec![
            FilterSpec::Blur { radius: 2.0 },
            FilterSpec::Fade {
                fade_in: 0.5,
                fade_out: 0.0,
            },
        ];

        let compiled = compiler.compile(&doc).await.unwrap();
        let ids: Vec<&str> = compiled.plan.nodes.iter().map(|n| n.id.as_str()).collect();
        let blur_pos = ids.iter().position(|id| *id == "seg0-filter0").unwrap();
        let fade_pos = ids.iter().position(|id| *id == "seg0-filter1").unwrap();
        let concat_pos = ids.iter().position(|id| *id == "concat").unwrap();
        assert!(blur_pos < fade_pos && fade_pos < concat_pos);

        // The chain feeds concat instead of the bare trim
        let concat = &compiled.plan.nodes[concat_pos];
        assert!(concat
            .inputs
            .contains(&NodeInput::Node("seg0-filter1".to_string())));
    }

    #[tokio::test]
    async fn test_uniform_sources_skip_normalization() {
        let ws = TestWorkspace::new();
        let (compiler, _, v1, v2, music) = setup(&ws).await;
        let mut doc = komposition(&v1, &v2, &music);
        for segment in &mut doc.segments {
            segment.source_ref = v1.to_string();
        }

        let compiled = compiler.compile(&doc).await.unwrap();
        let concat = compiled
            .plan
            .nodes
            .iter()
            .find(|n| n.id == "concat")
            .unwrap();
        match &concat.op {
            Operation::Concat(params) => assert!(!params.normalize),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_global_fade_feeds_audio_mix() {
        let ws = TestWorkspace::new();
        let (compiler, _, v1, v2, music) = setup(&ws).await;
        let mut doc = komposition(&v1, &v2, &music);
        doc.global_filters = vec![FilterSpec::Fade {
            fade_in: 1.0,
            fade_out: 2.0,
        }];

        let compiled = compiler.compile(&doc).await.unwrap();
        let mix = compiled
            .plan
            .nodes
            .iter()
            .find(|n| n.id == "audio-mix")
            .unwrap();
        match &mix.op {
            Operation::ReplaceAudio(params) => {
                assert_eq!(params.fade_in, 1.0);
                assert_eq!(params.fade_out, 2.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_compile_decompile_roundtrip() {
        let ws = TestWorkspace::new();
        let (compiler, _, v1, v2, music) = setup(&ws).await;
        let mut doc = komposition(&v1, &v2, &music);
        doc.segments[1].filters = vec![FilterSpec::Blur { radius: 1.5 }];
        doc.extra.insert(
            "client_notes".to_string(),
            serde_json::json!({"vibe": "retro"}),
        );

        let compiled = compiler.compile(&doc).await.unwrap();
        let recovered = decompile(&compiled.plan);
        assert_eq!(recovered, doc);
    }

    #[tokio::test]
    async fn test_persist_komposition_into_metadata_root() {
        let ws = TestWorkspace::new();
        let (compiler, registry, v1, v2, music) = setup(&ws).await;
        let doc = komposition(&v1, &v2, &music);

        let (id, path) = compiler.persist_komposition(&doc).await.unwrap();
        assert!(path.starts_with(registry.roots().path(RootName::Metadata)));

        let raw = std::fs::read_to_string(registry.resolve(&id).await.unwrap()).unwrap();
        let reloaded: Komposition = serde_json::from_str(&raw).unwrap();
        assert_eq!(reloaded, doc);
    }
}
