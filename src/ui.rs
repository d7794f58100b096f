use ratatui::{
    layout::{Constraint, Direction, Layout},
    style::{Color, Style},
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph, Wrap},
    Frame,
};

use deal_atlas::cluster::MapFeature;

use crate::map_draw::MapView;
use crate::state::{AppState, Panel};

pub fn draw(f: &mut Frame, state: &mut AppState) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(20),
            Constraint::Percentage(55),
            Constraint::Percentage(25),
        ].as_ref())
        .split(f.area());

    // Center: the map. Its panel size sets the viewport.
    let map_area = chunks[1];
    state.set_map_cells((map_area.width.saturating_sub(2), map_area.height.saturating_sub(2)));

    // Left: visible clusters and deals
    let items: Vec<ListItem> = state.list_items.iter().map(|i| ListItem::new(list_label(i))).collect();
    let mut list_state = ListState::default();
    list_state.select((!state.list_items.is_empty()).then_some(state.selected));
    let list = List::new(items)
        .block(panel_block("Visible", state.active_panel == Panel::Left))
        .highlight_symbol(">> ")
        .highlight_style(Style::default().fg(Color::Red));
    f.render_stateful_widget(list, chunks[0], &mut list_state);

    let annotations = state.visible_annotations();
    let highlight = state.list_items.get(state.selected).map(MapFeature::node_id);
    let map = MapView::new(state.view, state.map_cells, &state.visible, &annotations, highlight);
    let title = format!(
        "Map  {:.3}, {:.3}  z{:.1}  ({} markers)",
        state.view.latitude,
        state.view.longitude,
        state.view.zoom,
        map.feature_count()
    );
    map.render(f, map_area, &title);

    // Right column: summary, filters, annotations, keys
    let right_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage(30),
            Constraint::Percentage(25),
            Constraint::Percentage(25),
            Constraint::Percentage(20),
        ].as_ref())
        .split(chunks[2]);

    // Summary
    let summary = state.visible.summary;
    let stats = state.engine.stats();
    let mut summary_text = format!(
        "In view: {}\nTotal ask: {}\nAvg score: {}\nPassing filters: {} / {}",
        summary.visible_count,
        format_currency(summary.total_value),
        summary.avg_score.map_or_else(|| "–".to_string(), |s| format!("{s:.1}")),
        stats.passing,
        stats.total,
    );
    if stats.unlocated > 0 {
        summary_text.push_str(&format!("\nNot on map: {}", stats.unlocated));
    }
    if stats.invalid > 0 {
        summary_text.push_str(&format!("\nBad price or score: {}", stats.invalid));
    }
    summary_text.push_str(&format!("\n\n{}", state.info));
    let summary_paragraph = Paragraph::new(summary_text)
        .block(Block::default().borders(Borders::ALL).title("Summary"))
        .wrap(Wrap { trim: true });
    f.render_widget(summary_paragraph, right_chunks[0]);

    // Filters
    let active = state.engine.filter_state().active_count();
    let filter_paragraph = Paragraph::new(state.filter_summary())
        .block(Block::default().borders(Borders::ALL).title(format!("Filters ({active})")))
        .style(Style::default().fg(Color::White))
        .wrap(Wrap { trim: true });
    f.render_widget(filter_paragraph, right_chunks[1]);

    // Annotations
    let user = state.annotations.current_user().to_string();
    let items: Vec<ListItem> = annotations
        .iter()
        .map(|a| {
            let mut label = a.title.clone();
            if a.shared_with_team {
                label.push_str(" [team]");
            }
            if a.owner_id != user {
                label.push_str(&format!(" ({})", a.owner_id));
            }
            if a.is_local() {
                label.push_str(" …");
            }
            ListItem::new(label)
        })
        .collect();
    let mut ann_state = ListState::default();
    ann_state.select((!annotations.is_empty()).then_some(state.selected_annotation));
    let ann_list = List::new(items)
        .block(panel_block("Annotations", state.active_panel == Panel::Right))
        .highlight_symbol("> ")
        .highlight_style(Style::default().fg(Color::Red));
    f.render_stateful_widget(ann_list, right_chunks[2], &mut ann_state);

    let help = Paragraph::new(AppState::HELP_TEXT)
        .block(Block::default().borders(Borders::ALL).title("Keys"))
        .style(Style::default().fg(Color::DarkGray))
        .wrap(Wrap { trim: true });
    f.render_widget(help, right_chunks[3]);
}

fn panel_block(title: &str, active: bool) -> Block<'_> {
    let block = Block::default().borders(Borders::ALL).title(title);
    if active {
        block.border_style(Style::default().fg(Color::Yellow))
    } else {
        block
    }
}

fn list_label(item: &MapFeature) -> String {
    match item {
        MapFeature::Cluster(c) => format!("{} deals  {}", c.point_count, format_currency(c.total_value)),
        MapFeature::Leaf(l) => format!("{}  {}", l.deal.id, format_currency(l.deal.ask_price)),
    }
}

/// Compact dollar amount for narrow panels.
pub fn format_currency(value: f64) -> String {
    if value >= 1_000_000_000.0 {
        format!("${:.2}B", value / 1_000_000_000.0)
    } else if value >= 1_000_000.0 {
        format!("${:.2}M", value / 1_000_000.0)
    } else if value >= 1_000.0 {
        format!("${:.1}K", value / 1_000.0)
    } else {
        format!("${:.0}", value)
    }
}
