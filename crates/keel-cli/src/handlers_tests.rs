//! Tests for command handlers.

#[cfg(test)]
mod tests {
    use crate::commands::RunArgs;
    use crate::handlers::{
        TEMPLATE, executes, init, listing_lines, outcome_lines, run, validate,
    };
    use keel_core::RunOptions;
    use keel_engine::{EngineConfig, ExecutionSummary, GraphDefinition, ListingEntry, RunOutcome};
    use keel_scheduler::ExtensionRegistry;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    #[test]
    fn test_template_is_a_valid_graph() {
        let definition = GraphDefinition::from_yaml(TEMPLATE).unwrap();
        let loaded = definition.build(&ExtensionRegistry::new(), None).unwrap();
        assert_eq!(loaded.branch, "Main");
        assert_eq!(loaded.graph.len(), 3);
        assert!(loaded.graph.aggregate("All").is_some());
    }

    #[test]
    fn test_init_keeps_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.yaml");
        init(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), TEMPLATE);

        std::fs::write(&path, "branch: Mine\n").unwrap();
        init(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "branch: Mine\n");
    }

    #[test]
    fn test_plain_lines_without_colors() {
        console::set_colors_enabled(false);
        let entries = vec![
            ListingEntry::NodesHeader,
            ListingEntry::Agenda("make".to_string()),
        ];
        assert_eq!(
            listing_lines(&entries),
            vec![
                "*********** Desired And Dependent Nodes, in order.".to_string(),
                "         agenda> make".to_string(),
            ]
        );

        let summary = ExecutionSummary {
            built: vec!["Compile".to_string()],
            retrieved: vec!["Editor".to_string()],
        };
        assert_eq!(
            outcome_lines(&RunOutcome::Executed(summary)),
            vec![
                "✓ Built 1 nodes, retrieved 1".to_string(),
                "  built     Compile".to_string(),
                "  retrieved Editor".to_string(),
            ]
        );
        assert!(outcome_lines(&RunOutcome::Listed).is_empty());
        assert_eq!(
            outcome_lines(&RunOutcome::GraphSaved {
                path: PathBuf::from("graph.gv")
            }),
            vec!["✓ Saved graph to graph.gv".to_string()]
        );
    }

    #[test]
    fn test_only_plain_runs_execute() {
        assert!(executes(&RunOptions::default()));
        for options in [
            RunOptions {
                list_only: true,
                ..Default::default()
            },
            RunOptions {
                job_setup: true,
                ..Default::default()
            },
            RunOptions {
                show_history: Some("Compile".to_string()),
                ..Default::default()
            },
            RunOptions {
                save_graph: Some(PathBuf::from("graph.gv")),
                ..Default::default()
            },
        ] {
            assert!(!executes(&options));
        }
    }

    #[tokio::test]
    async fn test_fake_run_of_template() {
        let dir = tempfile::tempdir().unwrap();
        init(&dir.path().join("keel.yaml")).unwrap();
        let config = EngineConfig::new(dir.path(), None);
        validate(config.clone()).unwrap();

        let args = RunArgs {
            fake: true,
            ..Default::default()
        };
        run(config.clone(), &args, true).await.unwrap();
        assert!(!dir.path().join("Saved/TempStorage").exists());

        run(config, &args, false).await.unwrap();
        assert!(
            dir.path()
                .join("Saved/TempStorage/TempLocal--Compile.TempManifest")
                .exists()
        );
    }
}
