//! Human-readable CFG dump
//!
//! Renders the graph with reachability, fallthrough links, entry depths and
//! per-instruction assembler sizes. Used by the debug invariant-failure path
//! and available to embedders chasing producer bugs.

use std::io::IsTerminal;

use termcolor::{Buffer, Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

use super::ControlFlowGraph;

/// Colour is a property of where the dump lands, not of the graph: use it
/// only when stderr is a terminal and the user has not opted out.
fn dump_color_choice() -> ColorChoice {
    if std::env::var_os("NO_COLOR").is_some() || !std::io::stderr().is_terminal() {
        ColorChoice::Never
    } else {
        ColorChoice::Always
    }
}

impl ControlFlowGraph {
    /// Render the graph as plain text.
    pub fn dump_string(&self) -> String {
        let mut buffer = Buffer::no_color();
        // Writing into an in-memory buffer cannot fail.
        let _ = self.write_dump(&mut buffer);
        String::from_utf8_lossy(buffer.as_slice()).into_owned()
    }

    /// Print the graph to stderr, coloured when stderr is a terminal.
    pub fn eprint_dump(&self) {
        let stream = StandardStream::stderr(dump_color_choice());
        let mut lock = stream.lock();
        let _ = self.write_dump(&mut lock);
    }

    fn write_dump(&self, w: &mut dyn WriteColor) -> std::io::Result<()> {
        writeln!(
            w,
            "cfg: {} instructions, {} blocks",
            self.instructions.len(),
            self.blocks.len()
        )?;
        let mut dim = ColorSpec::new();
        dim.set_fg(Some(Color::Black)).set_intense(true);
        let mut head = ColorSpec::new();
        head.set_fg(Some(Color::Cyan)).set_bold(true);

        for (b, blk) in self.blocks.iter().enumerate() {
            if !blk.is_reachable {
                w.set_color(&dim)?;
                writeln!(w, "  (unreachable block {b})")?;
                w.reset()?;
                continue;
            }
            w.set_color(&head)?;
            match blk.entry_depth {
                Some(depth) => writeln!(
                    w,
                    "  block {b} (offset={}, size={}, depth={depth}):",
                    blk.offset, blk.size
                )?,
                None => writeln!(
                    w,
                    "  block {b} (offset={}, size={}, depth=?):",
                    blk.offset, blk.size
                )?,
            }
            w.reset()?;
            for i in blk.start..blk.end {
                let inst = &self.instructions[i];
                if inst.is_branch() {
                    writeln!(
                        w,
                        "    {i}: {} -> block {} @ line {} (size {})",
                        inst.opcode, inst.oparg, inst.line, inst.size
                    )?;
                } else {
                    writeln!(
                        w,
                        "    {i}: {} {} @ line {} (size {})",
                        inst.opcode, inst.oparg, inst.line, inst.size
                    )?;
                }
            }
            if let Some(f) = blk.fallthrough {
                writeln!(w, "    *fallthrough to block {f}")?;
            }
            if blk.is_exit {
                writeln!(w, "    *exit")?;
            }
        }
        Ok(())
    }
}
