use indoc::indoc;
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use tsh_rs_core::block::{Block, Input};
use tsh_rs_core::catalog::Catalog;
use tsh_rs_core::compile_source;
use tsh_rs_core::project::{compile_project, UnitSource};

fn compile(source: &str) -> Vec<Block> {
    let mut catalog = Catalog::builtin();
    compile_source(source, &mut catalog).expect("compile failure")
}

fn assert_graph_integrity(blocks: &[Block]) {
    let mut ids = HashSet::new();
    for block in blocks {
        assert!(ids.insert(block.id.clone()), "duplicate id {}", block.id);
    }
    for block in blocks {
        for id in block.parent.iter().chain(block.next.iter()) {
            assert!(ids.contains(id), "dangling link {} on {}", id, block.id);
        }
        for (name, input) in &block.inputs {
            if let Some(id) = input.referenced_block() {
                assert!(
                    ids.contains(id),
                    "dangling input {} -> {} on {}",
                    name,
                    id,
                    block.id
                );
            }
        }
    }
}

#[test]
fn whole_program_produces_a_closed_graph() {
    let source = indoc! {r#"
        // a small but representative program
        global var score = 0
        list inventory = {"sword", "shield"}

        warp fn award(points) {
            score = score + points
            inventory::push("medal")
        }

        fn best() {
            return data_itemoflist(1, "inventory")
        }

        gf {
            award(10)
            if (score >= 10) {
                looks_say(inventory::length)
            } else {
                looks_say("keep going")
            }
            for (i of 3) {
                looks_think(best())
            }
        }
    "#};
    let blocks = compile(source);
    assert_graph_integrity(&blocks);

    // four top-level chains: the score declaration, two definitions, and
    // the entry block (list declarations emit nothing)
    let top_level: Vec<&Block> = blocks.iter().filter(|b| b.top_level).collect();
    assert_eq!(top_level.len(), 4);
    assert!(blocks.iter().any(|b| b.opcode == "procedures_call"));
    assert!(blocks
        .iter()
        .any(|b| b.opcode == "procedures_definition_return"));
    assert!(blocks.iter().any(|b| b.opcode == "control_for_each"));
}

#[test]
fn nested_procedure_scopes_do_not_leak() {
    let source = indoc! {r#"
        var x = 1
        fn outer(p) {
            looks_say(p)
        }
        gf {
            looks_say(x)
        }
    "#};
    let blocks = compile(source);
    assert_graph_integrity(&blocks);
    // the entry script sees the variable, not a parameter reporter
    let entry = blocks
        .iter()
        .find(|b| b.opcode == "event_whenflagclicked")
        .unwrap();
    let first = blocks
        .iter()
        .find(|b| Some(b.id.as_str()) == entry.next.as_deref())
        .unwrap();
    assert!(matches!(
        &first.inputs[0].1,
        Input::Variable { name, .. } if name == "x"
    ));
}

#[test]
fn macro_registration_substitutes_identifiers() {
    let source = indoc! {r#"
        identifier_redefine(pi, 3.14)
        var x = pi
    "#};
    let blocks = compile(source);
    let set = blocks
        .iter()
        .find(|b| b.opcode == "data_setvariableto")
        .unwrap();
    assert_eq!(set.inputs[0].1, Input::Number(3.14));
}

#[test]
fn broadcast_hats_and_entry_blocks_coexist() {
    let source = indoc! {r#"
        gf {
            event_broadcast("go")
        }
        event_whenbroadcastreceived("go") {
            looks_say("received")
        }
    "#};
    let blocks = compile(source);
    assert_graph_integrity(&blocks);
    let hat = blocks
        .iter()
        .find(|b| b.opcode == "event_whenbroadcastreceived")
        .unwrap();
    assert!(hat.top_level);
    assert!(hat.next.is_some());
}

#[test]
fn cross_unit_globals_flow_stage_first() {
    let mut catalog = Catalog::builtin();
    let project = compile_project(
        &mut catalog,
        vec![
            UnitSource {
                name: "Player".to_string(),
                is_stage: false,
                source: "gf { lives = lives - 1 }".to_string(),
            },
            UnitSource {
                name: "Stage".to_string(),
                is_stage: true,
                source: "global var lives = 3".to_string(),
            },
        ],
    )
    .expect("project compile failure");

    assert!(project.units[0].is_stage);
    let lives_id = project.global_variables.get("lives").unwrap();
    let player = project.units.iter().find(|u| u.name == "Player").unwrap();
    let subtract = player
        .blocks
        .iter()
        .find(|b| b.opcode == "operator_subtract")
        .unwrap();
    assert!(matches!(
        &subtract.inputs[0].1,
        Input::Variable { id, .. } if id == lives_id
    ));
    for unit in &project.units {
        assert_graph_integrity(&unit.blocks);
    }
}

#[test]
fn emitted_json_is_deterministic() {
    let source = "gf { looks_say(\"hi\") }";
    let mut catalog_a = Catalog::builtin();
    let mut catalog_b = Catalog::builtin();
    let a = compile_project(
        &mut catalog_a,
        vec![UnitSource {
            name: "Stage".to_string(),
            is_stage: true,
            source: source.to_string(),
        }],
    )
    .unwrap();
    let b = compile_project(
        &mut catalog_b,
        vec![UnitSource {
            name: "Stage".to_string(),
            is_stage: true,
            source: source.to_string(),
        }],
    )
    .unwrap();
    assert_eq!(a.to_json(), b.to_json());
}
